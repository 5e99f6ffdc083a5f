use anyhow::Result;

/// The two item types the line monitor looks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemClass {
    OilCan,
    BunkHole,
}

impl ItemClass {
    pub const ALL: [ItemClass; 2] = [ItemClass::OilCan, ItemClass::BunkHole];

    /// Model class id 0 is the oil can; every other id is treated as a bunk hole.
    pub fn from_class_id(class_id: i64) -> Self {
        if class_id == 0 {
            ItemClass::OilCan
        } else {
            ItemClass::BunkHole
        }
    }

    /// Name used in configuration files (`oil_can`, `bunk_hole`).
    pub fn key(self) -> &'static str {
        match self {
            ItemClass::OilCan => "oil_can",
            ItemClass::BunkHole => "bunk_hole",
        }
    }

    /// Suffix used in boundary slot names (`pair1_oc`, `pair1_bh`).
    pub fn slot_suffix(self) -> &'static str {
        match self {
            ItemClass::OilCan => "oc",
            ItemClass::BunkHole => "bh",
        }
    }
}

/// Single detection returned by a model, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Detection {
    pub bbox_xyxy: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

impl Detection {
    pub fn class(&self) -> ItemClass {
        ItemClass::from_class_id(self.class_id)
    }

    /// Integer center of the bounding box (truncated toward zero).
    pub fn center(&self) -> (i32, i32) {
        let [x1, y1, x2, y2] = self.bbox_xyxy;
        (((x1 + x2) / 2.0) as i32, ((y1 + y2) / 2.0) as i32)
    }

    fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.bbox_xyxy;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    fn iou(&self, other: &Detection) -> f32 {
        let [ax1, ay1, ax2, ay2] = self.bbox_xyxy;
        let [bx1, by1, bx2, by2] = other.bbox_xyxy;
        let w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
        let h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
        let intersection = w * h;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }
}

/// A loaded detection model. Owned by exactly one worker thread.
pub trait DetectionModel: Send {
    /// Run inference on a BGR8 frame of `width` x `height` pixels.
    fn detect(&mut self, bgr: &[u8], width: i32, height: i32) -> Result<Vec<Detection>>;
}

/// Class-aware greedy non-maximum suppression. Output is sorted by score.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id && existing.iou(&candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Keeps the `limit` highest-scoring detections, in no particular order.
pub fn top_by_score(mut detections: Vec<Detection>, limit: usize) -> Vec<Detection> {
    if detections.len() > limit {
        detections.select_nth_unstable_by(limit, |a, b| b.score.total_cmp(&a.score));
        detections.truncate(limit);
    }
    detections
}
