//! Error types for the vision runtime.

use thiserror::Error;

use crate::pipeline::PipelineId;

/// Errors surfaced by the registries, the migrator and the control surface.
#[derive(Debug, Error)]
pub enum VisionError {
    /// Out-of-range hardware parameter; camera state is left unchanged
    #[error("Invalid value for '{field}': {reason}")]
    InvalidSettingValue { field: String, reason: String },

    /// A camera name did not resolve
    #[error("Camera not found: {0}")]
    CameraNotFound(String),

    /// Delete blocked because pipelines still reference the camera
    #[error("Camera '{camera}' is in use by pipelines {pipelines:?}")]
    CameraInUse {
        camera: String,
        pipelines: Vec<PipelineId>,
    },

    #[error("Camera already registered: {0}")]
    DuplicateCamera(String),

    /// Names of deleted cameras are never handed out again
    #[error("Camera name was retired and cannot be reused: {0}")]
    CameraNameRetired(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    /// Hardware settings belong to cameras, never to pipelines
    #[error("Pipeline settings may not carry hardware field '{0}'")]
    HardwareFieldInPipeline(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Pipeline {pipeline} missed its deadline for frame {sequence}")]
    ProcessingTimeout { pipeline: PipelineId, sequence: u64 },

    /// Results and frame belong to different cycles
    #[error("Cycle {results} results cannot annotate frame {frame}")]
    StaleCycle { frame: u64, results: u64 },

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Two cameras resolve to the same port pair
    #[error("Port conflict: cameras '{first}' and '{second}' both use stream index {stream_index}")]
    PortConflict {
        first: String,
        second: String,
        stream_index: u32,
    },

    #[error("Backup unreadable: {0}")]
    BackupUnreadable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for VisionError {
    fn from(err: serde_yaml::Error) -> Self {
        VisionError::Parse(err.to_string())
    }
}

impl VisionError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        VisionError::InvalidSettingValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;

/// Errors reported by a frame source.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Capture timed out after {0} ms")]
    Timeout(u64),

    /// Transient failure; the camera is retried with backoff
    #[error("Device error: {0}")]
    Device(String),

    /// The device is gone or was never opened
    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Camera is waiting for its next reconnect probe")]
    Backoff,
}

/// Errors reported by a pipeline processor.
#[derive(Debug, Clone, Error)]
pub enum ProcessingError {
    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Processing failed: {0}")]
    Failed(String),
}

/// A per-unit failure while migrating a legacy document.
#[derive(Debug, Clone, Error)]
#[error("unit {unit} ('{camera}'): {reason}")]
pub struct MigrationError {
    /// Position of the legacy camera unit in persisted order
    pub unit: usize,
    pub camera: String,
    pub reason: String,
}
