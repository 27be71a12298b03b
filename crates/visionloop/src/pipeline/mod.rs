//! Pipelines: independent processing configurations that reference a camera
//! by name.

mod registry;
mod result;
mod settings;

pub use registry::{CycleClaim, PipelineRegistry, PipelineView, RunState};
pub use result::{Color, Overlay, PipelineResult, Target};
pub use settings::{check_no_hardware_fields, OutputFlags, PipelineRecord, PipelineSettings};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a pipeline, unique within a persisted document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(pub u32);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
