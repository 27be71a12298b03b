//! Version 1 document: each camera embeds its pipelines, and every pipeline
//! carries a copy of the camera's hardware settings.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;

use crate::camera::{
    validate_unique_name, CameraSettings, ExposureMode, HardwareSettings, WhiteBalanceMode,
    HARDWARE_FIELDS,
};
use crate::error::MigrationError;
use crate::pipeline::{PipelineId, PipelineRecord, PipelineSettings};
use crate::ports::{check_port_conflicts, next_free_stream_index};
use crate::store::PersistedDocument;

#[derive(Debug, Deserialize)]
pub struct LegacyDocument {
    #[serde(default)]
    pub cameras: Vec<LegacyCamera>,
}

/// Camera unit with its embedded pipelines
#[derive(Debug, Deserialize)]
pub struct LegacyCamera {
    pub unique_name: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub stream_index: Option<u32>,
    #[serde(default)]
    pub pipelines: Vec<LegacyPipeline>,
}

#[derive(Debug, Deserialize)]
pub struct LegacyPipeline {
    #[serde(default)]
    pub nickname: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Hardware and processing keys, mixed
    #[serde(default)]
    pub settings: Mapping,
}

fn enabled() -> bool {
    true
}

/// Convert a version 1 blob into the decoupled document.
///
/// Hardware settings of each camera are taken from its first pipeline; later
/// pipelines only lose their hardware keys. Any unit that fails fails the
/// whole conversion.
pub fn convert(blob: &str) -> Result<PersistedDocument, MigrationError> {
    let legacy: LegacyDocument = serde_yaml::from_str(blob).map_err(|e| MigrationError {
        unit: 0,
        camera: String::new(),
        reason: format!("unreadable legacy document: {}", e),
    })?;

    let mut doc = PersistedDocument::default();
    let mut names = HashSet::new();
    let mut next_id = 1;

    for (unit, camera) in legacy.cameras.into_iter().enumerate() {
        let fail = |reason: String| MigrationError {
            unit,
            camera: camera.unique_name.clone(),
            reason,
        };
        validate_unique_name(&camera.unique_name).map_err(|e| fail(e.to_string()))?;
        if !names.insert(camera.unique_name.clone()) {
            return Err(fail("camera name appears twice".to_string()));
        }

        let hardware = match camera.pipelines.first() {
            Some(first) => extract_hardware(&first.settings).map_err(&fail)?,
            None => HardwareSettings::default(),
        };
        hardware.validate(None).map_err(|e| fail(e.to_string()))?;

        for pipeline in &camera.pipelines {
            let mut settings =
                PipelineSettings::new(pipeline.nickname.clone(), camera.unique_name.clone());
            settings.enabled = pipeline.enabled;
            settings.params = strip_hardware(&pipeline.settings);
            doc.pipelines.push(PipelineRecord {
                id: PipelineId(next_id),
                settings,
            });
            next_id += 1;
        }

        let nickname = if camera.nickname.is_empty() {
            camera.unique_name.clone()
        } else {
            camera.nickname.clone()
        };
        doc.cameras.push(CameraSettings {
            unique_name: camera.unique_name.clone(),
            nickname,
            stream_index: camera.stream_index,
            hardware,
        });
    }

    // Cameras without a stream index get the lowest free ones, in order
    for index in 0..doc.cameras.len() {
        if doc.cameras[index].stream_index.is_none() {
            let used = doc.cameras.iter().filter_map(|c| c.stream_index);
            doc.cameras[index].stream_index = Some(next_free_stream_index(used));
        }
    }
    check_port_conflicts(
        doc.cameras
            .iter()
            .map(|c| (c.unique_name.as_str(), c.stream_index.unwrap_or_default())),
    )
    .map_err(|e| {
        let unit = match &e {
            crate::error::VisionError::PortConflict { second, .. } => doc
                .cameras
                .iter()
                .position(|c| &c.unique_name == second)
                .unwrap_or_default(),
            _ => 0,
        };
        MigrationError {
            unit,
            camera: doc.cameras.get(unit).map(|c| c.unique_name.clone()).unwrap_or_default(),
            reason: e.to_string(),
        }
    })?;

    doc.next_pipeline_id = next_id;
    Ok(doc)
}

fn strip_hardware(settings: &Mapping) -> Mapping {
    settings
        .iter()
        .filter(|(key, _)| !key.as_str().is_some_and(|k| HARDWARE_FIELDS.contains(&k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn field<T: DeserializeOwned>(settings: &Mapping, key: &str) -> Result<Option<T>, String> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_yaml::from_value(value.clone())
            .map(Some)
            .map_err(|e| format!("field '{}': {}", key, e)),
    }
}

/// Legacy numeric fields were sometimes written as floats
fn whole(settings: &Mapping, key: &str) -> Result<Option<i32>, String> {
    match field::<f64>(settings, key)? {
        None => Ok(None),
        Some(v) if v.fract() == 0.0 && v >= f64::from(i32::MIN) && v <= f64::from(i32::MAX) => {
            Ok(Some(v as i32))
        }
        Some(v) => Err(format!("field '{}': expected a whole number, got {}", key, v)),
    }
}

fn extract_hardware(settings: &Mapping) -> Result<HardwareSettings, String> {
    let mut hw = HardwareSettings::default();

    if let Some(v) = field::<usize>(settings, "video_mode_index")? {
        hw.video_mode_index = v;
    }
    if let Some(v) = field::<ExposureMode>(settings, "exposure_mode")? {
        hw.exposure_mode = v;
    }
    if let Some(auto) = field::<bool>(settings, "auto_exposure")? {
        hw.exposure_mode = if auto {
            ExposureMode::Auto
        } else {
            ExposureMode::Manual
        };
    }
    if let Some(v) = field::<f64>(settings, "exposure")? {
        hw.exposure = v;
    }
    if let Some(v) = field::<f64>(settings, "exposure_min")? {
        hw.exposure_bounds.min = v;
    }
    if let Some(v) = field::<f64>(settings, "exposure_max")? {
        hw.exposure_bounds.max = v;
    }
    if let Some(v) = whole(settings, "brightness")? {
        hw.brightness = v;
    }
    if let Some(v) = whole(settings, "gain")? {
        hw.gain = v;
    }
    if let Some(v) = whole(settings, "red_gain")? {
        hw.red_gain = v;
    }
    if let Some(v) = whole(settings, "blue_gain")? {
        hw.blue_gain = v;
    }
    if let Some(v) = field::<WhiteBalanceMode>(settings, "white_balance_mode")? {
        hw.white_balance_mode = v;
    }
    if let Some(auto) = field::<bool>(settings, "auto_white_balance")? {
        hw.white_balance_mode = if auto {
            WhiteBalanceMode::Auto
        } else {
            WhiteBalanceMode::Manual
        };
    }
    if let Some(v) = field::<f64>(settings, "white_balance_temperature")? {
        hw.white_balance_temperature = v;
    }
    Ok(hw)
}
