use serde::{Deserialize, Serialize};

/// One frame-local person bounding box, `[x1, y1, x2, y2]` in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: [f32; 4], confidence: f32) -> Self {
        Self { bbox, confidence }
    }

    pub fn center(&self) -> (f32, f32) {
        let [x1, y1, x2, y2] = self.bbox;
        ((x1 + x2) / 2.0, (y1 + y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.bbox;
        (x2 - x1) * (y2 - y1)
    }

    /// Finite coordinates, non-inverted box and a confidence inside `[0, 1]`.
    pub fn is_well_formed(&self) -> bool {
        let [x1, y1, x2, y2] = self.bbox;
        self.bbox.iter().all(|v| v.is_finite())
            && x2 >= x1
            && y2 >= y1
            && (0.0..=1.0).contains(&self.confidence)
    }
}
