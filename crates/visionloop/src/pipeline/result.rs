use serde::{Deserialize, Serialize};

/// RGB color used for overlays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(pub u8, pub u8, pub u8);

impl Color {
    pub const GREEN: Color = Color(0, 255, 0);
    pub const RED: Color = Color(255, 0, 0);
    pub const YELLOW: Color = Color(255, 255, 0);

    /// Luminance used when drawing onto grayscale frames
    pub fn luma(self) -> u8 {
        ((u32::from(self.0) * 299 + u32::from(self.1) * 587 + u32::from(self.2) * 114) / 1000)
            as u8
    }
}

/// Drawing primitive a pipeline asks to composite onto the output frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Overlay {
    /// Rectangle outline
    Rect {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        color: Color,
    },
    /// Plus-shaped marker centred on a point
    Crosshair { x: i32, y: i32, size: u32, color: Color },
    /// Open polyline through the given points
    Polyline { points: Vec<(i32, i32)>, color: Color },
}

/// A detected target, in pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub center_x: f64,
    pub center_y: f64,
    /// Fraction of the frame covered, 0..1
    pub area: f64,
    #[serde(default)]
    pub confidence: f64,
}

/// Output of one pipeline for one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub targets: Vec<Target>,
    pub overlays: Vec<Overlay>,
    /// Processor-specific extra data for telemetry
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl PipelineResult {
    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_overlay(mut self, overlay: Overlay) -> Self {
        self.overlays.push(overlay);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luma() {
        assert_eq!(Color(255, 255, 255).luma(), 255);
        assert_eq!(Color(0, 0, 0).luma(), 0);
        assert_eq!(Color::GREEN.luma(), 149);
    }

    #[test]
    fn test_overlay_is_tagged() {
        let overlay = Overlay::Crosshair {
            x: 4,
            y: 5,
            size: 3,
            color: Color::RED,
        };
        let json = serde_json::to_value(&overlay).unwrap();
        assert_eq!(json["kind"], "crosshair");
        assert_eq!(json["x"], 4);
    }
}
