//! Cameras: physical frame sources, their hardware settings and liveness.

mod liveness;
mod registry;
mod settings;

pub use liveness::{BackoffPolicy, Liveness, LivenessState, ProbeDecision};
pub use registry::{CameraEntry, CameraEvent, CameraReferences, CameraRegistry, CameraView};
pub use settings::{
    validate_unique_name, CameraSettings, ExposureBounds, ExposureMode, HardwarePatch,
    HardwareSettings, WhiteBalanceMode, HARDWARE_FIELDS,
};
