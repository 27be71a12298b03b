//! Camera hardware settings and their validation.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VisionError};

/// Keys that describe camera hardware. They live on cameras only and are
/// stripped from (or rejected in) pipeline settings.
pub const HARDWARE_FIELDS: &[&str] = &[
    "video_mode_index",
    "exposure",
    "auto_exposure",
    "exposure_mode",
    "exposure_min",
    "exposure_max",
    "brightness",
    "gain",
    "red_gain",
    "blue_gain",
    "auto_white_balance",
    "white_balance_mode",
    "white_balance_temperature",
];

pub const PERCENT_RANGE: (i32, i32) = (0, 100);
pub const WHITE_BALANCE_RANGE: (f64, f64) = (2_000.0, 10_000.0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhiteBalanceMode {
    #[default]
    Auto,
    Manual,
}

/// Exposure limits reported by (or configured for) the sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for ExposureBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 100.0 }
    }
}

/// Hardware parameters applied to the capture device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSettings {
    pub video_mode_index: usize,
    pub exposure_mode: ExposureMode,
    pub exposure: f64,
    pub exposure_bounds: ExposureBounds,
    pub brightness: i32,
    pub gain: i32,
    pub red_gain: i32,
    pub blue_gain: i32,
    pub white_balance_mode: WhiteBalanceMode,
    pub white_balance_temperature: f64,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            video_mode_index: 0,
            exposure_mode: ExposureMode::Auto,
            exposure: 50.0,
            exposure_bounds: ExposureBounds::default(),
            brightness: 50,
            gain: 50,
            red_gain: 50,
            blue_gain: 50,
            white_balance_mode: WhiteBalanceMode::Auto,
            white_balance_temperature: 4_000.0,
        }
    }
}

impl HardwareSettings {
    /// Check every field against its allowed range.
    ///
    /// `video_modes` is the number of modes the device advertises, when known.
    pub fn validate(&self, video_modes: Option<usize>) -> Result<()> {
        if let Some(count) = video_modes {
            if self.video_mode_index >= count {
                return Err(VisionError::invalid(
                    "video_mode_index",
                    format!("{} out of range, device has {} modes", self.video_mode_index, count),
                ));
            }
        }

        let bounds = self.exposure_bounds;
        if !bounds.min.is_finite() || !bounds.max.is_finite() || bounds.min > bounds.max {
            return Err(VisionError::invalid(
                "exposure_bounds",
                format!("invalid range {}..{}", bounds.min, bounds.max),
            ));
        }
        if !self.exposure.is_finite() || self.exposure < bounds.min || self.exposure > bounds.max {
            return Err(VisionError::invalid(
                "exposure",
                format!("{} outside {}..{}", self.exposure, bounds.min, bounds.max),
            ));
        }

        for (field, value) in [
            ("brightness", self.brightness),
            ("gain", self.gain),
            ("red_gain", self.red_gain),
            ("blue_gain", self.blue_gain),
        ] {
            check_percent(field, value)?;
        }

        let (lo, hi) = WHITE_BALANCE_RANGE;
        let temp = self.white_balance_temperature;
        if !temp.is_finite() || temp < lo || temp > hi {
            return Err(VisionError::invalid(
                "white_balance_temperature",
                format!("{} outside {}..{}", temp, lo, hi),
            ));
        }
        Ok(())
    }

    /// Produce the settings that result from applying `patch`, validated as a whole.
    pub fn patched(&self, patch: &HardwarePatch, video_modes: Option<usize>) -> Result<Self> {
        let mut next = self.clone();
        if let Some(v) = patch.video_mode_index {
            next.video_mode_index = v;
        }
        if let Some(v) = patch.exposure_mode {
            next.exposure_mode = v;
        }
        if let Some(v) = patch.exposure {
            next.exposure = v;
        }
        if let Some(v) = patch.exposure_bounds {
            next.exposure_bounds = v;
        }
        if let Some(v) = patch.brightness {
            next.brightness = v;
        }
        if let Some(v) = patch.gain {
            next.gain = v;
        }
        if let Some(v) = patch.red_gain {
            next.red_gain = v;
        }
        if let Some(v) = patch.blue_gain {
            next.blue_gain = v;
        }
        if let Some(v) = patch.white_balance_mode {
            next.white_balance_mode = v;
        }
        if let Some(v) = patch.white_balance_temperature {
            next.white_balance_temperature = v;
        }
        next.validate(video_modes)?;
        Ok(next)
    }
}

fn check_percent(field: &str, value: i32) -> Result<()> {
    let (lo, hi) = PERCENT_RANGE;
    if value < lo || value > hi {
        return Err(VisionError::invalid(
            field,
            format!("{} outside {}..{}", value, lo, hi),
        ));
    }
    Ok(())
}

/// Partial hardware update; absent fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwarePatch {
    pub video_mode_index: Option<usize>,
    pub exposure_mode: Option<ExposureMode>,
    pub exposure: Option<f64>,
    pub exposure_bounds: Option<ExposureBounds>,
    pub brightness: Option<i32>,
    pub gain: Option<i32>,
    pub red_gain: Option<i32>,
    pub blue_gain: Option<i32>,
    pub white_balance_mode: Option<WhiteBalanceMode>,
    pub white_balance_temperature: Option<f64>,
}

/// Persisted definition of one camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Stable, globally unique identity
    pub unique_name: String,
    /// Display name, free to change
    #[serde(default)]
    pub nickname: String,
    /// Determines the camera's port pair; `None` asks the registry to assign one
    #[serde(default)]
    pub stream_index: Option<u32>,
    #[serde(default)]
    pub hardware: HardwareSettings,
}

impl CameraSettings {
    pub fn new(unique_name: impl Into<String>) -> Self {
        let unique_name = unique_name.into();
        Self {
            nickname: unique_name.clone(),
            unique_name,
            stream_index: None,
            hardware: HardwareSettings::default(),
        }
    }

    pub fn with_stream_index(mut self, stream_index: u32) -> Self {
        self.stream_index = Some(stream_index);
        self
    }

    pub fn with_hardware(mut self, hardware: HardwareSettings) -> Self {
        self.hardware = hardware;
        self
    }
}

/// Validate a camera unique name: 1-64 chars, `[a-zA-Z0-9_-]` only.
pub fn validate_unique_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(VisionError::invalid(
            "unique_name",
            format!("must be 1-64 characters, got {}", name.len()),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(VisionError::invalid(
            "unique_name",
            "may only contain alphanumeric characters, hyphens, and underscores",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        HardwareSettings::default().validate(Some(1)).unwrap();
    }

    #[test]
    fn test_patch_applies_only_present_fields() {
        let base = HardwareSettings::default();
        let patch = HardwarePatch {
            exposure: Some(30.0),
            exposure_mode: Some(ExposureMode::Manual),
            ..Default::default()
        };
        let next = base.patched(&patch, None).unwrap();
        assert_eq!(next.exposure, 30.0);
        assert_eq!(next.exposure_mode, ExposureMode::Manual);
        assert_eq!(next.brightness, base.brightness);
    }

    #[test]
    fn test_exposure_outside_bounds_rejected() {
        let patch = HardwarePatch {
            exposure_bounds: Some(ExposureBounds { min: 10.0, max: 20.0 }),
            ..Default::default()
        };
        // current exposure (50) is outside the new bounds
        let err = HardwareSettings::default().patched(&patch, None).unwrap_err();
        assert!(matches!(err, VisionError::InvalidSettingValue { ref field, .. } if field == "exposure"));
    }

    #[test]
    fn test_percent_fields_rejected() {
        let patch = HardwarePatch {
            red_gain: Some(101),
            ..Default::default()
        };
        let err = HardwareSettings::default().patched(&patch, None).unwrap_err();
        assert!(matches!(err, VisionError::InvalidSettingValue { ref field, .. } if field == "red_gain"));
    }

    #[test]
    fn test_video_mode_checked_against_device() {
        let patch = HardwarePatch {
            video_mode_index: Some(3),
            ..Default::default()
        };
        assert!(HardwareSettings::default().patched(&patch, Some(3)).is_err());
        assert!(HardwareSettings::default().patched(&patch, Some(4)).is_ok());
        assert!(HardwareSettings::default().patched(&patch, None).is_ok());
    }

    #[test]
    fn test_white_balance_range() {
        let patch = HardwarePatch {
            white_balance_temperature: Some(12_000.0),
            ..Default::default()
        };
        assert!(HardwareSettings::default().patched(&patch, None).is_err());
    }

    #[test]
    fn test_unique_name_validation() {
        assert!(validate_unique_name("Cam0").is_ok());
        assert!(validate_unique_name("usb-cam_2").is_ok());
        assert!(validate_unique_name("").is_err());
        assert!(validate_unique_name("cam 0").is_err());
        assert!(validate_unique_name(&"x".repeat(65)).is_err());
    }
}
