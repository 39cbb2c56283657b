use serde::{Deserialize, Serialize};

use crate::bounding_box::{BoundingBox, Dimensions, Rect, iou};
use crate::config::{Anchor, CELL_SIZE};
use crate::decoder::GridPosition;
use crate::error::TinyYolov2Error;

/// A labeled box, relative to the image it annotates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruth {
    /// Left edge, in [0, 1].
    pub x: f32,
    /// Top edge, in [0, 1].
    pub y: f32,
    /// Width, `x + width` must not exceed 1.
    pub width: f32,
    /// Height, `y + height` must not exceed 1.
    pub height: f32,
    /// Index into the configured classes.
    #[serde(alias = "classLabel")]
    pub label: usize,
}

impl GroundTruth {
    /// Create a new ground truth box.
    pub fn new(x: f32, y: f32, width: f32, height: f32, label: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
            label,
        }
    }

    /// The box as a relative rect.
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// A ground truth box together with the slot responsible for predicting it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruthWithGridPosition {
    /// Relative box.
    pub bbox: BoundingBox,
    /// Class label.
    pub label: usize,
    /// Assigned cell and anchor.
    pub position: GridPosition,
}

/// Reject empty boxes, boxes outside of the unit square and labels without a class.
pub fn validate_ground_truth(
    ground_truth: &[GroundTruth],
    num_classes: usize,
) -> Result<(), TinyYolov2Error> {
    let in_unit = |v: f32| (0.0..=1.0).contains(&v);
    for gt in ground_truth {
        if gt.label >= num_classes {
            return Err(TinyYolov2Error::data(format!(
                "invalid class label: {}, expected a label in [0, {}]",
                gt.label,
                num_classes.saturating_sub(1)
            )));
        }
        let inside = in_unit(gt.x)
            && in_unit(gt.y)
            && gt.width > 0.0
            && gt.height > 0.0
            && in_unit(gt.x + gt.width)
            && in_unit(gt.y + gt.height);
        if !inside {
            return Err(TinyYolov2Error::data(format!(
                "ground truth box out of bounds: {gt:?}"
            )));
        }
    }
    Ok(())
}

/// Assign every box to the grid cell containing its center and to the anchor
/// with the best matching shape.
///
/// `reshaped_dims` is the size of the image after the aspect keeping resize, its
/// longer side being the network input size. Boxes sharing a slot are all returned,
/// the later one wins when targets are written.
pub fn assign_ground_truth_to_anchors(
    ground_truth: &[GroundTruth],
    anchors: &[Anchor],
    reshaped_dims: Dimensions,
) -> Vec<GroundTruthWithGridPosition> {
    let input_size = reshaped_dims.max_side();
    let num_cells = (input_size / CELL_SIZE as f32).floor().max(1.0);
    let last_cell = num_cells as usize - 1;

    ground_truth
        .iter()
        .map(|gt| {
            let bbox = gt.rect().to_bounding_box();
            let abs = bbox.rescale(reshaped_dims);
            let (width, height) = (abs.width(), abs.height());
            let ct_x = abs.left + width / 2.0;
            let ct_y = abs.top + height / 2.0;

            // a center on the far edge still belongs to the last cell
            let cell = |ct: f32| ((ct / input_size * num_cells).floor().max(0.0) as usize).min(last_cell);

            let shape = BoundingBox::new(0.0, 0.0, width, height);
            let (anchor, _) = anchors.iter().enumerate().fold(
                (0, f32::NEG_INFINITY),
                |best, (idx, anchor)| {
                    let prior = BoundingBox::new(
                        0.0,
                        0.0,
                        anchor.x * CELL_SIZE as f32,
                        anchor.y * CELL_SIZE as f32,
                    );
                    let overlap = iou(&prior, &shape);
                    if overlap > best.1 { (idx, overlap) } else { best }
                },
            );

            GroundTruthWithGridPosition {
                bbox,
                label: gt.label,
                position: GridPosition {
                    row: cell(ct_y),
                    col: cell(ct_x),
                    anchor,
                },
            }
        })
        .collect()
}

/// Drop boxes smaller than `min_box_size` pixels in either direction once mapped
/// into `image_dims`.
pub fn filter_ground_truth_boxes(
    ground_truth: &[GroundTruth],
    image_dims: Dimensions,
    min_box_size: f32,
) -> Vec<GroundTruth> {
    ground_truth
        .iter()
        .filter(|gt| {
            let rect = gt.rect().rescale(image_dims);
            rect.width >= min_box_size && rect.height >= min_box_size
        })
        .copied()
        .collect()
}
