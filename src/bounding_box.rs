use serde::Serialize;

/// Bounding box struct for detection results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    /// Minimum x coordinate of the bounding box.
    pub xmin: f32,
    /// Minimum y coordinate of the bounding box.
    pub ymin: f32,
    /// Maximum x coordinate of the bounding box.
    pub xmax: f32,
    /// Maximum y coordinate of the bounding box.
    pub ymax: f32,
    /// Confidence score of the bounding box.
    pub confidence: f32,
    /// Class index of the bounding box.
    pub class: u32,
}

impl BoundingBox {
    /// Clamp the box corners to the `[0, width] x [0, height]` image rectangle.
    pub fn clip(self, width: f32, height: f32) -> Self {
        Self {
            xmin: self.xmin.clamp(0., width),
            ymin: self.ymin.clamp(0., height),
            xmax: self.xmax.clamp(0., width),
            ymax: self.ymax.clamp(0., height),
            ..self
        }
    }
}

/// Intersection over union of two bounding boxes.
fn iou(b1: &BoundingBox, b2: &BoundingBox) -> f32 {
    let b1_area = (b1.xmax - b1.xmin + 1.) * (b1.ymax - b1.ymin + 1.);
    let b2_area = (b2.xmax - b2.xmin + 1.) * (b2.ymax - b2.ymin + 1.);
    let i_xmin = b1.xmin.max(b2.xmin);
    let i_xmax = b1.xmax.min(b2.xmax);
    let i_ymin = b1.ymin.max(b2.ymin);
    let i_ymax = b1.ymax.min(b2.ymax);
    let i_area = (i_xmax - i_xmin + 1.).max(0.) * (i_ymax - i_ymin + 1.).max(0.);
    i_area / (b1_area + b2_area - i_area)
}

/// Non-maximum suppression for bounding boxes.
///
/// `bboxes` holds one vector per class; suppression only happens between boxes
/// of the same class. Each vector is left sorted by decreasing confidence with
/// the boxes overlapping a better one (IoU above `threshold`) removed.
///
/// # Arguments
///
/// * `bboxes` - A mutable reference to the per-class bounding boxes.
/// * `threshold` - The IoU threshold for suppression.
pub fn non_maximum_suppression(bboxes: &mut [Vec<BoundingBox>], threshold: f32) {
    for bboxes_for_class in bboxes.iter_mut() {
        bboxes_for_class.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
        let mut current_index = 0;
        for index in 0..bboxes_for_class.len() {
            let mut drop = false;
            for prev_index in 0..current_index {
                let iou = iou(&bboxes_for_class[prev_index], &bboxes_for_class[index]);
                if iou > threshold {
                    drop = true;
                    break;
                }
            }
            if !drop {
                bboxes_for_class.swap(current_index, index);
                current_index += 1;
            }
        }
        bboxes_for_class.truncate(current_index);
    }
}
