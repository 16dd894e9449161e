//! Detection payloads returned by the remote detector.
//!
//! Wire field names follow the detector service (`ships`, `class`, `conf`,
//! `bbox`, `total_ships`). Boxes are in source-raster pixel coordinates.

use serde::{Deserialize, Serialize};

/// One detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label, e.g. "tanker"
    #[serde(rename = "class")]
    pub class_name: String,
    /// Confidence in [0, 1]
    #[serde(rename = "conf")]
    pub confidence: f32,
    /// [x1, y1, x2, y2]
    pub bbox: [f32; 4],
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }

    /// Box with corners ordered so that x1 <= x2 and y1 <= y2.
    pub fn normalized_bbox(&self) -> [f32; 4] {
        let [a, b, c, d] = self.bbox;
        [a.min(c), b.min(d), a.max(c), b.max(d)]
    }

    /// Confidence as a whole percentage, rounded to nearest.
    pub fn confidence_percent(&self) -> u32 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).round() as u32
    }

    /// Chip text: class name plus rounded confidence percentage.
    pub fn label(&self) -> String {
        format!("{} {}%", self.class_name, self.confidence_percent())
    }
}

/// One inbound message from the detector.
///
/// Each result fully replaces the previous one for rendering purposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub ships: Vec<Detection>,
    #[serde(default)]
    pub total_ships: u32,
}

impl DetectionResult {
    /// Decode a JSON message from the channel.
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn is_empty(&self) -> bool {
        self.ships.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_detector_message() {
        let raw = br#"{"ships":[{"class":"tanker","conf":0.92,"bbox":[10,10,110,60]}],"total_ships":1}"#;
        let result = DetectionResult::from_json(raw).unwrap();

        assert_eq!(result.total_ships, 1);
        assert_eq!(result.ships.len(), 1);
        assert_eq!(result.ships[0].class_name, "tanker");
        assert_eq!(result.ships[0].bbox, [10.0, 10.0, 110.0, 60.0]);
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let result = DetectionResult::from_json(b"{}").unwrap();
        assert!(result.is_empty());
        assert_eq!(result.total_ships, 0);
    }

    #[test]
    fn test_label_rounds_confidence() {
        assert_eq!(Detection::new("tanker", 0.92, [0.0; 4]).label(), "tanker 92%");
        assert_eq!(Detection::new("boat", 0.506, [0.0; 4]).label(), "boat 51%");
        assert_eq!(Detection::new("ship", 1.2, [0.0; 4]).label(), "ship 100%");
    }

    #[test]
    fn test_normalized_bbox_orders_corners() {
        let det = Detection::new("ship", 0.5, [110.0, 60.0, 10.0, 10.0]);
        assert_eq!(det.normalized_bbox(), [10.0, 10.0, 110.0, 60.0]);
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let raw = br#"{"ships":[],"total_ships":0,"frame":17,"has_ships":false}"#;
        assert!(DetectionResult::from_json(raw).is_ok());
    }
}
