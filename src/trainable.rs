use candle_core::{Tensor, Var};
use candle_nn::Optimizer;
use kornia_image::{Image, ImageSize};

use crate::assignment::{GroundTruth, filter_ground_truth_boxes, validate_ground_truth};
use crate::bounding_box::Dimensions;
use crate::config::{CELL_SIZE, InputSize, TinyYolov2TrainableConfig};
use crate::error::TinyYolov2Error;
use crate::loss::TinyYolov2LossFunction;
use crate::report::{LossReport, YoloLoss};
use crate::tiny_yolov2::{TinyYolov2, reshaped_size};

/// Options of a training step.
pub struct BackwardOptions<'a> {
    /// Ground truth boxes smaller than this, in pixels of the resized image, are ignored.
    pub min_box_size: f32,
    /// Called with the losses of the step before the weights are updated.
    pub on_loss_report: Option<&'a mut dyn FnMut(&LossReport)>,
}

impl Default for BackwardOptions<'_> {
    fn default() -> Self {
        Self {
            min_box_size: CELL_SIZE as f32,
            on_loss_report: None,
        }
    }
}

/// A loaded Tiny YOLOv2 detector whose weights are updated by an optimizer.
pub struct TinyYolov2Trainable<O: Optimizer> {
    net: TinyYolov2,
    config: TinyYolov2TrainableConfig,
    optimizer: O,
}

impl<O: Optimizer> TinyYolov2Trainable<O> {
    /// Turn the weights of a loaded detector into variables and create the optimizer on them.
    ///
    /// `config.model` has to match the configuration the detector was created with.
    pub fn new(
        config: TinyYolov2TrainableConfig,
        mut net: TinyYolov2,
        optimizer_config: O::Config,
    ) -> Result<Self, TinyYolov2Error> {
        config.validate()?;
        if net.config() != &config.model {
            return Err(TinyYolov2Error::config(
                "training configuration does not match the detector configuration",
            ));
        }

        let mut vars = Vec::new();
        for tensor in net.params_mut()?.tensors_mut() {
            let var = Var::from_tensor(tensor)?;
            *tensor = var.as_tensor().clone();
            vars.push(var);
        }
        tracing::debug!("training {} parameter tensors", vars.len());

        Ok(Self {
            net,
            config,
            optimizer: O::new(vars, optimizer_config)?,
        })
    }

    /// The detector being trained.
    pub fn net(&self) -> &TinyYolov2 {
        &self.net
    }

    /// The training configuration.
    pub fn config(&self) -> &TinyYolov2TrainableConfig {
        &self.config
    }

    /// The optimizer, e.g. to adjust the learning rate.
    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    /// Stop training and return the detector.
    pub fn into_inner(self) -> TinyYolov2 {
        self.net
    }

    /// Run one optimization step on a single image.
    ///
    /// Returns the total loss before the update, or `None` when no ground truth box is
    /// left after dropping the ones smaller than `options.min_box_size`.
    pub fn backward(
        &mut self,
        image: &Image<u8, 3>,
        ground_truth: &[GroundTruth],
        input_size: u32,
        options: BackwardOptions<'_>,
    ) -> Result<Option<f32>, TinyYolov2Error> {
        let input_size = InputSize::Custom(input_size).size()?;
        validate_ground_truth(ground_truth, self.config.model.num_classes())?;

        let reshaped = reshaped_size(
            ImageSize {
                width: image.width(),
                height: image.height(),
            },
            input_size as usize,
        );
        let reshaped_dims = Dimensions::new(reshaped.width as f32, reshaped.height as f32);
        let filtered = self.filter_ground_truth_boxes(ground_truth, reshaped_dims, options.min_box_size);
        if filtered.is_empty() {
            tracing::trace!("no ground truth box of at least {} pixels", options.min_box_size);
            return Ok(None);
        }

        let (output, reshaped_dims) = self.net.forward(image, input_size)?;
        let losses = self.compute_loss(&output, &filtered, reshaped_dims)?;

        if let Some(on_loss_report) = options.on_loss_report {
            on_loss_report(&LossReport {
                losses: losses.to_scalars()?,
                num_boxes: filtered.len(),
                input_size,
            });
        }

        let total = losses.total.to_scalar::<f32>()?;
        if !total.is_finite() {
            return Err(TinyYolov2Error::data(format!(
                "loss is not finite: {total}, weights left unchanged"
            )));
        }
        self.optimizer.backward_step(&losses.total)?;

        tracing::trace!("input size {input_size}, {} boxes, loss {total}", filtered.len());
        Ok(Some(total))
    }

    /// Compute the loss terms of a raw output grid.
    pub fn compute_loss(
        &self,
        output: &Tensor,
        ground_truth: &[GroundTruth],
        reshaped_dims: Dimensions,
    ) -> Result<YoloLoss<Tensor>, TinyYolov2Error> {
        let predicted_boxes = self.net.extract_boxes(output, reshaped_dims, None)?;
        TinyYolov2LossFunction::new(
            output,
            ground_truth,
            predicted_boxes,
            reshaped_dims,
            &self.config,
        )?
        .compute_loss()
    }

    /// Ground truth boxes at least `min_box_size` pixels wide and high in `image_dims`.
    pub fn filter_ground_truth_boxes(
        &self,
        ground_truth: &[GroundTruth],
        image_dims: Dimensions,
        min_box_size: f32,
    ) -> Vec<GroundTruth> {
        filter_ground_truth_boxes(ground_truth, image_dims, min_box_size)
    }
}
