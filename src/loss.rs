use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::ops::sigmoid;

use crate::assignment::{
    GroundTruth, GroundTruthWithGridPosition, assign_ground_truth_to_anchors,
    validate_ground_truth,
};
use crate::bounding_box::{Dimensions, iou};
use crate::config::{CELL_SIZE, TinyYolov2TrainableConfig};
use crate::decoder::{DecodedBox, GridPosition, softmax_last_dim, split_anchors};
use crate::error::TinyYolov2Error;
use crate::masks::{GridShape, LossMasks};
use crate::report::YoloLoss;

/// The Tiny YOLOv2 training loss of one image.
///
/// Owns the assigned ground truth, the masks and the decoded predictions of a
/// single step and is dropped with it.
pub struct TinyYolov2LossFunction<'a> {
    config: &'a TinyYolov2TrainableConfig,
    reshaped_dims: Dimensions,
    output: Tensor,
    shape: GridShape,
    ground_truth: Vec<GroundTruthWithGridPosition>,
    predicted_boxes: HashMap<GridPosition, DecodedBox>,
    masks: LossMasks,
}

impl<'a> TinyYolov2LossFunction<'a> {
    /// Create the loss function of one image.
    ///
    /// # Arguments
    ///
    /// * `output` - Raw network output, `[1, cells, cells, anchors * encoding]`.
    /// * `ground_truth` - Relative boxes of the image.
    /// * `predicted_boxes` - The decoded output, at least one box per assigned slot.
    /// * `reshaped_dims` - Size of the image after the aspect keeping resize.
    /// * `config` - The training configuration.
    pub fn new(
        output: &Tensor,
        ground_truth: &[GroundTruth],
        predicted_boxes: Vec<DecodedBox>,
        reshaped_dims: Dimensions,
        config: &'a TinyYolov2TrainableConfig,
    ) -> Result<Self, TinyYolov2Error> {
        let model = &config.model;
        validate_ground_truth(ground_truth, model.num_classes())?;

        let input_size = reshaped_dims.max_side();
        if !input_size.is_finite() || input_size < CELL_SIZE as f32 {
            return Err(TinyYolov2Error::config(format!(
                "invalid inputSize: {input_size}"
            )));
        }

        let shape = GridShape {
            num_cells: (input_size / CELL_SIZE as f32) as usize,
            num_anchors: model.num_anchors(),
            box_encoding_size: model.box_encoding_size(),
        };
        let expected = (
            1,
            shape.num_cells,
            shape.num_cells,
            shape.num_anchors * shape.box_encoding_size,
        );
        if output.dims4()? != expected {
            return Err(TinyYolov2Error::InternalConsistency(format!(
                "expected output of shape {expected:?}, have: {:?}",
                output.dims()
            )));
        }

        let ground_truth = assign_ground_truth_to_anchors(ground_truth, &model.anchors, reshaped_dims);
        let masks = LossMasks::new(&ground_truth, shape, output.device())?;
        let predicted_boxes = predicted_boxes
            .into_iter()
            .map(|pred| (pred.position, pred))
            .collect();

        Ok(Self {
            config,
            reshaped_dims,
            output: split_anchors(output, shape.num_anchors)?,
            shape,
            ground_truth,
            predicted_boxes,
            masks,
        })
    }

    /// The ground truth with the slots it was assigned to.
    pub fn ground_truth(&self) -> &[GroundTruthWithGridPosition] {
        &self.ground_truth
    }

    /// The masks of the loss terms.
    pub fn masks(&self) -> &LossMasks {
        &self.masks
    }

    /// The grid layout of the output.
    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Compute all loss terms and their sum.
    pub fn compute_loss(&self) -> Result<YoloLoss<Tensor>, TinyYolov2Error> {
        let no_object = self.compute_no_object_loss()?;
        let object = self.compute_object_loss()?;
        let coord = self.compute_coord_loss()?;
        let class = if self.config.model.with_class_scores() {
            self.compute_class_loss()?
        } else {
            Tensor::new(0f32, self.output.device())?
        };
        let total = no_object.add(&object)?.add(&coord)?.add(&class)?;

        Ok(YoloLoss {
            total,
            no_object,
            object,
            coord,
            class,
        })
    }

    /// Penalizes objectness of slots without an assigned box.
    pub fn compute_no_object_loss(&self) -> Result<Tensor, TinyYolov2Error> {
        loss_term(
            self.config.no_object_scale,
            &self.masks.no_object,
            &sigmoid(&self.output)?,
        )
    }

    /// Pulls the objectness of assigned slots towards the IoU of the predicted box
    /// with its ground truth.
    pub fn compute_object_loss(&self) -> Result<Tensor, TinyYolov2Error> {
        let error = self.compute_ious()?.sub(&sigmoid(&self.output)?)?;
        loss_term(self.config.object_scale, &self.masks.object, &error)
    }

    /// Box offset and size loss of assigned slots.
    pub fn compute_coord_loss(&self) -> Result<Tensor, TinyYolov2Error> {
        let offset = self.compute_coord_box_offset_error()?.sqr()?.sum_all()?;
        let size = self.compute_coord_box_size_error()?.sqr()?.sum_all()?;
        Ok(offset.add(&size)?.affine(self.config.coord_scale as f64, 0.)?)
    }

    /// Class loss of assigned slots, softmax is taken over the class scores only.
    pub fn compute_class_loss(&self) -> Result<Tensor, TinyYolov2Error> {
        let num_classes = self.config.model.num_classes();
        let scores = softmax_last_dim(&self.output.narrow(3, 5, num_classes)?)?;
        let mask = self
            .masks
            .ground_truth_class_scores
            .narrow(3, 5, num_classes)?;
        let error = self.one_hot_class_scores()?.sub(&scores)?;
        loss_term(self.config.class_scale, &mask, &error)
    }

    /// Masked difference between the target offsets and `sigmoid(raw)` at indices 0 and 1.
    pub fn compute_coord_box_offset_error(&self) -> Result<Tensor, TinyYolov2Error> {
        let error = self
            .compute_coord_box_offsets()?
            .sub(&sigmoid(&self.output)?)?;
        Ok(self.masks.coord_box_offset.mul(&error)?)
    }

    /// Masked difference between the target sizes and the raw output at indices 2 and 3.
    pub fn compute_coord_box_size_error(&self) -> Result<Tensor, TinyYolov2Error> {
        let error = self.compute_coord_box_sizes()?.sub(&self.output)?;
        Ok(self.masks.coord_box_size.mul(&error)?)
    }

    /// IoU of every assigned box with the box predicted at its slot, at index 4.
    pub fn compute_ious(&self) -> Result<Tensor, TinyYolov2Error> {
        let mut ious = vec![0f32; self.shape.elem_count()];
        for gt in &self.ground_truth {
            let pos = gt.position;
            let pred = self.predicted_boxes.get(&pos).ok_or_else(|| {
                TinyYolov2Error::InternalConsistency(format!(
                    "no output box found for: row {}, col {}, anchor {}",
                    pos.row, pos.col, pos.anchor
                ))
            })?;
            ious[self.shape.index(pos.row, pos.col, pos.anchor, 4)] = iou(
                &gt.bbox.rescale(self.reshaped_dims),
                &pred.bbox.rescale(self.reshaped_dims),
            );
        }
        self.grid_tensor(ious)
    }

    /// Center of every assigned box relative to its cell, at indices 0 and 1.
    pub fn compute_coord_box_offsets(&self) -> Result<Tensor, TinyYolov2Error> {
        let cell_size = CELL_SIZE as f32;
        let mut offsets = vec![0f32; self.shape.elem_count()];
        for gt in &self.ground_truth {
            let pos = gt.position;
            let abs = gt.bbox.rescale(self.reshaped_dims);
            let ct_x = (abs.left + abs.right) / 2.;
            let ct_y = (abs.top + abs.bottom) / 2.;
            let idx = self.shape.index(pos.row, pos.col, pos.anchor, 0);
            offsets[idx] = (ct_x - pos.col as f32 * cell_size) / cell_size;
            offsets[idx + 1] = (ct_y - pos.row as f32 * cell_size) / cell_size;
        }
        self.grid_tensor(offsets)
    }

    /// Log scale of every assigned box relative to its anchor, at indices 2 and 3.
    pub fn compute_coord_box_sizes(&self) -> Result<Tensor, TinyYolov2Error> {
        let cell_size = CELL_SIZE as f32;
        let mut sizes = vec![0f32; self.shape.elem_count()];
        for gt in &self.ground_truth {
            let pos = gt.position;
            let abs = gt.bbox.rescale(self.reshaped_dims);
            let anchor = self.config.model.anchors[pos.anchor];
            let idx = self.shape.index(pos.row, pos.col, pos.anchor, 2);
            sizes[idx] = (abs.width() / (anchor.x * cell_size)).ln();
            sizes[idx + 1] = (abs.height() / (anchor.y * cell_size)).ln();
        }
        self.grid_tensor(sizes)
    }

    /// One hot encoded labels of assigned slots, `[cells, cells, anchors, classes]`.
    fn one_hot_class_scores(&self) -> Result<Tensor, TinyYolov2Error> {
        let num_classes = self.config.model.num_classes();
        let class_shape = GridShape {
            box_encoding_size: num_classes,
            ..self.shape
        };
        let mut one_hot = vec![0f32; class_shape.elem_count()];
        for gt in &self.ground_truth {
            let pos = gt.position;
            let start = class_shape.index(pos.row, pos.col, pos.anchor, 0);
            one_hot[start..start + num_classes].fill(0.);
            one_hot[start + gt.label] = 1.;
        }
        Ok(Tensor::from_vec(one_hot, class_shape.dims(), self.output.device())?)
    }

    fn grid_tensor(&self, values: Vec<f32>) -> Result<Tensor, TinyYolov2Error> {
        Ok(Tensor::from_vec(values, self.shape.dims(), self.output.device())?
            .to_dtype(self.output.dtype())?)
    }
}

/// `scale * sum((mask * error)^2)`.
fn loss_term(scale: f32, mask: &Tensor, error: &Tensor) -> Result<Tensor, TinyYolov2Error> {
    let masked = mask.to_dtype(error.dtype())?.mul(error)?;
    Ok(masked.sqr()?.sum_all()?.affine(scale as f64, 0.)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::Rect;
    use crate::config::{Anchor, TinyYolov2Config};
    use candle_core::Device;

    const SURE: f32 = 50.;

    fn inverse_sigmoid(x: f32) -> f32 {
        (x / (1. - x)).ln()
    }

    fn fake_config(anchors: Vec<Anchor>) -> TinyYolov2TrainableConfig {
        TinyYolov2TrainableConfig {
            model: TinyYolov2Config {
                with_separable_convs: true,
                iou_threshold: 0.4,
                anchors,
                classes: vec!["foo".into(), "bar".into()],
                ..Default::default()
            },
            object_scale: 5.,
            no_object_scale: 1.,
            coord_scale: 1.,
            class_scale: 0.,
        }
    }

    /// A grid of ones of `num_cells` per side with `values` set at flat indices.
    fn fake_output(
        config: &TinyYolov2TrainableConfig,
        num_cells: usize,
        values: &[(usize, f32)],
    ) -> candle_core::Result<Tensor> {
        let channels = config.model.num_anchors() * config.model.box_encoding_size();
        let mut data = vec![1f32; num_cells * num_cells * channels];
        for &(idx, v) in values {
            data[idx] = v;
        }
        Tensor::from_vec(data, (1, num_cells, num_cells, channels), &Device::Cpu)
    }

    fn predicted(rect: Rect, row: usize, col: usize, anchor: usize) -> DecodedBox {
        DecodedBox {
            bbox: rect.to_bounding_box(),
            score: 1.,
            class_score: 1.,
            label: 0,
            position: GridPosition { row, col, anchor },
        }
    }

    fn grid_dims(num_cells: usize) -> Dimensions {
        Dimensions::square((num_cells * CELL_SIZE as usize) as f32)
    }

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_object_loss_matching_iou() -> Result<(), Box<dyn std::error::Error>> {
        let config = fake_config(vec![Anchor::new(1., 1.)]);
        let shape = GridShape {
            num_cells: 2,
            num_anchors: 1,
            box_encoding_size: 7,
        };
        // IoU of 0.5 and sigmoid(0) = 0.5 at both boxes
        let output = fake_output(
            &config,
            2,
            &[(shape.index(0, 0, 0, 4), 0.), (shape.index(1, 1, 0, 4), 0.)],
        )?;
        let ground_truth = [
            GroundTruth::new(0., 0., 0.25, 0.5, 0),
            GroundTruth::new(0.5, 0.5, 0.25, 0.5, 0),
        ];
        let predicted_boxes = vec![
            predicted(Rect::new(0., 0., 0.25, 0.25), 0, 0, 0),
            predicted(Rect::new(0.5, 0.5, 0.25, 0.25), 1, 1, 0),
        ];

        let loss_fn =
            TinyYolov2LossFunction::new(&output, &ground_truth, predicted_boxes, grid_dims(2), &config)?;
        assert!(scalar(loss_fn.compute_object_loss()?).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_object_loss_no_overlap() -> Result<(), Box<dyn std::error::Error>> {
        let cases = [
            // (anchors, num_cells, ground truth, predicted, position)
            (
                vec![Anchor::new(1., 1.)],
                2,
                Rect::new(0., 0., 0.25, 0.25),
                Rect::new(0.5, 0.5, 0.25, 0.25),
                (0, 0, 0),
            ),
            (
                vec![
                    Anchor::new(2., 2.),
                    Anchor::new(1., 1.),
                    Anchor::new(4., 4.),
                    Anchor::new(2., 4.),
                ],
                2,
                Rect::new(0., 0., 0.25, 0.25),
                Rect::new(0.5, 0.5, 0.25, 0.25),
                (0, 0, 1),
            ),
            (
                vec![Anchor::new(1., 1.)],
                2,
                Rect::new(0.5, 0.5, 0.25, 0.25),
                Rect::new(0.75, 0.75, 0.25, 0.25),
                (1, 1, 0),
            ),
            (
                vec![Anchor::new(1., 1.)],
                10,
                Rect::new(0.9, 0.9, 0.05, 0.05),
                Rect::new(0.95, 0.95, 0.05, 0.05),
                (9, 9, 0),
            ),
        ];

        for (anchors, num_cells, gt, pred, (row, col, anchor)) in cases {
            let config = fake_config(anchors);
            let shape = GridShape {
                num_cells,
                num_anchors: config.model.num_anchors(),
                box_encoding_size: 7,
            };
            let output = fake_output(&config, num_cells, &[(shape.index(row, col, anchor, 4), SURE)])?;
            let ground_truth = [GroundTruth::new(gt.x, gt.y, gt.width, gt.height, 0)];

            let loss_fn = TinyYolov2LossFunction::new(
                &output,
                &ground_truth,
                vec![predicted(pred, row, col, anchor)],
                grid_dims(num_cells),
                &config,
            )?;
            assert_eq!(loss_fn.ground_truth()[0].position, GridPosition { row, col, anchor });
            assert!((scalar(loss_fn.compute_object_loss()?) - 5.).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_missing_prediction() -> Result<(), Box<dyn std::error::Error>> {
        let config = fake_config(vec![Anchor::new(1., 1.)]);
        let output = fake_output(&config, 2, &[])?;
        let ground_truth = [GroundTruth::new(0., 0., 0.25, 0.25, 0)];
        let loss_fn = TinyYolov2LossFunction::new(
            &output,
            &ground_truth,
            vec![predicted(Rect::new(0., 0., 0.25, 0.25), 1, 1, 0)],
            grid_dims(2),
            &config,
        )?;
        assert!(matches!(
            loss_fn.compute_object_loss(),
            Err(TinyYolov2Error::InternalConsistency(_))
        ));
        Ok(())
    }

    #[test]
    fn test_coord_box_offsets() -> Result<(), Box<dyn std::error::Error>> {
        let config = fake_config(vec![Anchor::new(1., 1.)]);
        let output = fake_output(&config, 2, &[])?;
        let cases = [
            (Rect::new(0., 0., 0.25, 0.25), (0, 0)),
            (Rect::new(0., 0., 0.5, 0.5), (0, 0)),
            (Rect::new(0.25, 0.25, 0.25, 0.25), (0, 0)),
            (Rect::new(0.5, 0.5, 0.25, 0.25), (1, 1)),
            (Rect::new(0.75, 0.75, 0.25, 0.25), (1, 1)),
            (Rect::new(0.25, 0.75, 0.25, 0.25), (1, 0)),
            (Rect::new(0.75, 0.25, 0.25, 0.25), (0, 1)),
        ];

        for (rect, (row, col)) in cases {
            let ground_truth = [GroundTruth::new(rect.x, rect.y, rect.width, rect.height, 0)];
            let loss_fn =
                TinyYolov2LossFunction::new(&output, &ground_truth, vec![], grid_dims(2), &config)?;
            let shape = loss_fn.shape();
            let offsets = loss_fn.compute_coord_box_offsets()?.flatten_all()?.to_vec1::<f32>()?;
            let sizes = loss_fn.compute_coord_box_sizes()?.flatten_all()?.to_vec1::<f32>()?;

            let (ct_x, ct_y) = rect.center();
            let dx = offsets[shape.index(row, col, 0, 0)];
            let dy = offsets[shape.index(row, col, 0, 1)];
            assert!(((col as f32 + dx) / 2. - ct_x).abs() < 1e-4);
            assert!(((row as f32 + dy) / 2. - ct_y).abs() < 1e-4);

            let dw = sizes[shape.index(row, col, 0, 2)];
            let dh = sizes[shape.index(row, col, 0, 3)];
            assert!((dw.exp() / 2. - rect.width).abs() < 1e-4);
            assert!((dh.exp() / 2. - rect.height).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_coord_box_offset_error() -> Result<(), Box<dyn std::error::Error>> {
        let anchor = Anchor::new(2., 4.);
        let cases = [
            // (anchors, ground truth, slot, target offsets)
            (vec![anchor], Rect::new(0., 0.125, 0.5, 0.25), (0, 0, 0), (0.5, 0.5)),
            (vec![anchor], Rect::new(0.5, 0.5, 0.5, 0.25), (1, 1, 0), (0.5, 0.25)),
            (
                vec![Anchor::new(100., 100.), anchor],
                Rect::new(0.5, 0.5, 0.5, 0.25),
                (1, 1, 1),
                (0.5, 0.25),
            ),
        ];

        for (anchors, rect, (row, col, a), (tx, ty)) in cases {
            let config = fake_config(anchors);
            let shape = GridShape {
                num_cells: 2,
                num_anchors: config.model.num_anchors(),
                box_encoding_size: 7,
            };
            let ground_truth = [GroundTruth::new(rect.x, rect.y, rect.width, rect.height, 0)];

            for (shift, zero) in [(0f32, true), (2f32, false)] {
                let output = fake_output(
                    &config,
                    2,
                    &[
                        (shape.index(row, col, a, 0), shift + inverse_sigmoid(tx)),
                        (shape.index(row, col, a, 1), shift + inverse_sigmoid(ty)),
                    ],
                )?;
                let loss_fn =
                    TinyYolov2LossFunction::new(&output, &ground_truth, vec![], grid_dims(2), &config)?;
                let error = scalar(loss_fn.compute_coord_box_offset_error()?.sum_all()?);
                if zero {
                    assert!(error.abs() < 1e-4);
                } else {
                    assert!(error.abs() > 0.);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_coord_box_size_error() -> Result<(), Box<dyn std::error::Error>> {
        let anchor = Anchor::new(2., 4.);
        let config = fake_config(vec![anchor]);
        let shape = GridShape {
            num_cells: 2,
            num_anchors: 1,
            box_encoding_size: 7,
        };

        for (rect, (row, col)) in [
            (Rect::new(0., 0., 0.5, 0.5), (0, 0)),
            (Rect::new(0.5, 0.5, 0.5, 0.5), (1, 1)),
        ] {
            let ground_truth = [GroundTruth::new(rect.x, rect.y, rect.width, rect.height, 0)];
            let dw = (rect.width / (anchor.x / 2.)).ln();
            let dh = (rect.height / (anchor.y / 2.)).ln();

            for (shift, zero) in [(0f32, true), (1f32, false)] {
                let output = fake_output(
                    &config,
                    2,
                    &[
                        (shape.index(row, col, 0, 2), dw + shift),
                        (shape.index(row, col, 0, 3), dh + shift),
                    ],
                )?;
                let loss_fn =
                    TinyYolov2LossFunction::new(&output, &ground_truth, vec![], grid_dims(2), &config)?;
                let error = scalar(loss_fn.compute_coord_box_size_error()?.abs()?.sum_all()?);
                if zero {
                    assert!(error < 1e-5);
                } else {
                    assert!((error - 2.).abs() < 1e-4);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_class_loss() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = fake_config(vec![Anchor::new(1., 1.)]);
        config.class_scale = 1.;
        let shape = GridShape {
            num_cells: 2,
            num_anchors: 1,
            box_encoding_size: 7,
        };
        let ground_truth = [GroundTruth::new(0., 0., 0.5, 0.5, 1)];

        // equal class scores: softmax is 0.5 for both classes
        let output = fake_output(&config, 2, &[])?;
        let loss_fn =
            TinyYolov2LossFunction::new(&output, &ground_truth, vec![], grid_dims(2), &config)?;
        assert!((scalar(loss_fn.compute_class_loss()?) - 0.5).abs() < 1e-5);

        // confident and correct
        let output = fake_output(
            &config,
            2,
            &[(shape.index(0, 0, 0, 5), -SURE), (shape.index(0, 0, 0, 6), SURE)],
        )?;
        let loss_fn =
            TinyYolov2LossFunction::new(&output, &ground_truth, vec![], grid_dims(2), &config)?;
        assert!(scalar(loss_fn.compute_class_loss()?) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_compute_loss_total() -> Result<(), Box<dyn std::error::Error>> {
        let config = fake_config(vec![Anchor::new(1., 1.)]);
        let output = fake_output(&config, 2, &[])?;
        let ground_truth = [GroundTruth::new(0., 0., 0.5, 0.5, 0)];
        let loss_fn = TinyYolov2LossFunction::new(
            &output,
            &ground_truth,
            vec![predicted(Rect::new(0., 0., 0.5, 0.5), 0, 0, 0)],
            grid_dims(2),
            &config,
        )?;

        let loss = loss_fn.compute_loss()?.to_scalars()?;
        let sum = loss.no_object + loss.object + loss.coord + loss.class;
        assert!((loss.total - sum).abs() < 1e-5);
        // class scale is zero
        assert_eq!(loss.class, 0.);
        // three unassigned slots with sigmoid(1)
        let s = 1. / (1. + (-1f32).exp());
        assert!((loss.no_object - 3. * s * s).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_invalid_ground_truth() -> Result<(), Box<dyn std::error::Error>> {
        let config = fake_config(vec![Anchor::new(1., 1.)]);
        let output = fake_output(&config, 2, &[])?;
        let ground_truth = [GroundTruth::new(0., 0., 0.5, 0.5, 2)];
        assert!(matches!(
            TinyYolov2LossFunction::new(&output, &ground_truth, vec![], grid_dims(2), &config),
            Err(TinyYolov2Error::Data(_))
        ));

        let ground_truth = [GroundTruth::new(0., 0., 0.5, 0.5, 0)];
        assert!(matches!(
            TinyYolov2LossFunction::new(&output, &ground_truth, vec![], grid_dims(3), &config),
            Err(TinyYolov2Error::InternalConsistency(_))
        ));
        Ok(())
    }
}
