use candle_core::{D, Tensor};

use crate::bounding_box::{BoundingBox, Dimensions};
use crate::config::{Anchor, TinyYolov2Config};
use crate::error::TinyYolov2Error;

/// A prediction slot of the output grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridPosition {
    /// Grid row.
    pub row: usize,
    /// Grid column.
    pub col: usize,
    /// Anchor index within the cell.
    pub anchor: usize,
}

/// A candidate box decoded from the network output.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBox {
    /// Box relative to the unpadded input image.
    pub bbox: BoundingBox,
    /// Objectness, `sigmoid(raw[4])`.
    pub score: f32,
    /// Objectness times the probability of `label`.
    pub class_score: f32,
    /// Index of the most likely class.
    pub label: usize,
    /// The slot the box was decoded from.
    pub position: GridPosition,
}

/// Turns raw `[1, cells, cells, anchors * encoding]` outputs into boxes.
#[derive(Debug, Clone)]
pub struct GridBoxDecoder {
    anchors: Vec<Anchor>,
    box_encoding_size: usize,
    num_classes: usize,
    with_class_scores: bool,
}

impl GridBoxDecoder {
    /// Create a decoder for the given configuration.
    pub fn new(config: &TinyYolov2Config) -> Self {
        Self {
            anchors: config.anchors.clone(),
            box_encoding_size: config.box_encoding_size(),
            num_classes: config.num_classes(),
            with_class_scores: config.with_class_scores(),
        }
    }

    /// Decode every slot whose objectness is above `score_threshold`.
    ///
    /// # Arguments
    ///
    /// * `output` - Raw network output, `[1, cells, cells, anchors * encoding]`.
    /// * `blob_dims` - Size of the image after the aspect keeping resize, before padding.
    /// * `score_threshold` - Keep only boxes with a strictly larger objectness, `None` keeps all.
    pub fn decode(
        &self,
        output: &Tensor,
        blob_dims: Dimensions,
        score_threshold: Option<f32>,
    ) -> Result<Vec<DecodedBox>, TinyYolov2Error> {
        let (batch, rows, cols, channels) = output.dims4()?;
        let num_anchors = self.anchors.len();
        if batch != 1 || rows != cols || channels != num_anchors * self.box_encoding_size {
            return Err(TinyYolov2Error::InternalConsistency(format!(
                "expected output of shape [1, n, n, {}], have: {:?}",
                num_anchors * self.box_encoding_size,
                output.dims()
            )));
        }

        let num_cells = rows;
        let input_size = blob_dims.max_side();
        let correction_x = input_size / blob_dims.width;
        let correction_y = input_size / blob_dims.height;

        let values = output.flatten_all()?.to_vec1::<f32>()?;

        let mut boxes = Vec::new();
        for (slot, encoding) in values.chunks_exact(self.box_encoding_size).enumerate() {
            let score = sigmoid(encoding[4]);
            if score_threshold.is_some_and(|threshold| score <= threshold) {
                continue;
            }

            let position = GridPosition {
                row: slot / (num_cells * num_anchors),
                col: (slot / num_anchors) % num_cells,
                anchor: slot % num_anchors,
            };
            let anchor = self.anchors[position.anchor];
            let cells = num_cells as f32;

            let ct_x = (position.col as f32 + sigmoid(encoding[0])) / cells * correction_x;
            let ct_y = (position.row as f32 + sigmoid(encoding[1])) / cells * correction_y;
            let width = encoding[2].exp() * anchor.x / cells * correction_x;
            let height = encoding[3].exp() * anchor.y / cells * correction_y;

            let (label, class_score) = if self.with_class_scores {
                let probs = softmax(&encoding[5..5 + self.num_classes]);
                let (label, prob) = argmax(&probs);
                (label, score * prob)
            } else {
                (0, score)
            };

            let left = ct_x - width / 2.0;
            let top = ct_y - height / 2.0;
            boxes.push(DecodedBox {
                bbox: BoundingBox::new(left, top, left + width, top + height),
                score,
                class_score,
                label,
                position,
            });
        }

        Ok(boxes)
    }
}

/// Reshape a `[1, cells, cells, anchors * encoding]` output to `[cells, cells, anchors, encoding]`.
pub(crate) fn split_anchors(output: &Tensor, num_anchors: usize) -> candle_core::Result<Tensor> {
    let (_, rows, cols, channels) = output.dims4()?;
    output.reshape((rows, cols, num_anchors, channels / num_anchors))
}

/// Softmax over the last axis of `xs`.
pub(crate) fn softmax_last_dim(xs: &Tensor) -> candle_core::Result<Tensor> {
    candle_nn::ops::softmax(xs, D::Minus1)
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(xs: &[f32]) -> Vec<f32> {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = xs.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and value of the first maximum.
fn argmax(xs: &[f32]) -> (usize, f32) {
    xs.iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (idx, x)| {
            if x > best.1 { (idx, x) } else { best }
        })
}
