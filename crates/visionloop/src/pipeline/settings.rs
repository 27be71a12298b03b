use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::PipelineId;
use crate::camera::HARDWARE_FIELDS;
use crate::error::{Result, VisionError};

/// What a pipeline contributes to the camera's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFlags {
    /// Composite this pipeline's overlays onto the annotated stream
    pub draw_overlays: bool,
    /// Include this pipeline's targets in published results
    pub publish_results: bool,
}

impl Default for OutputFlags {
    fn default() -> Self {
        Self {
            draw_overlays: true,
            publish_results: true,
        }
    }
}

/// Processing configuration of one pipeline. Never carries hardware fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub nickname: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Name of the camera this pipeline reads from, resolved every cycle
    pub source_camera_unique_name: String,
    #[serde(default)]
    pub output: OutputFlags,
    /// Processor parameters, passed through untouched
    #[serde(default)]
    pub params: Mapping,
}

fn default_enabled() -> bool {
    true
}

impl PipelineSettings {
    pub fn new(nickname: impl Into<String>, source_camera: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            enabled: true,
            source_camera_unique_name: source_camera.into(),
            output: OutputFlags::default(),
            params: Mapping::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(Value::String(key.to_string()), value.into());
        self
    }

    /// Look up a processor parameter by key
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn validate(&self) -> Result<()> {
        check_no_hardware_fields(&self.params)
    }
}

/// Reject parameter maps that contain camera hardware keys.
pub fn check_no_hardware_fields(params: &Mapping) -> Result<()> {
    for key in params.keys() {
        if let Some(name) = key.as_str() {
            if HARDWARE_FIELDS.contains(&name) {
                return Err(VisionError::HardwareFieldInPipeline(name.to_string()));
            }
        }
    }
    Ok(())
}

/// Persisted form of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: PipelineId,
    #[serde(flatten)]
    pub settings: PipelineSettings,
}
