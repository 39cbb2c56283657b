use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::Serialize;

/// The four loss terms of a training step and their sum.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YoloLoss<T> {
    /// Sum of the four terms.
    pub total: T,
    /// Objectness loss of slots without an object.
    pub no_object: T,
    /// Objectness loss of slots with an object.
    pub object: T,
    /// Box offset and size loss.
    pub coord: T,
    /// Class score loss.
    pub class: T,
}

impl YoloLoss<Tensor> {
    /// Read the scalar value of every term.
    pub fn to_scalars(&self) -> candle_core::Result<YoloLoss<f32>> {
        Ok(YoloLoss {
            total: self.total.to_scalar::<f32>()?,
            no_object: self.no_object.to_scalar::<f32>()?,
            object: self.object.to_scalar::<f32>()?,
            coord: self.coord.to_scalar::<f32>()?,
            class: self.class.to_scalar::<f32>()?,
        })
    }
}

/// Losses of a single training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LossReport {
    /// The loss terms.
    pub losses: YoloLoss<f32>,
    /// Number of ground truth boxes left after filtering.
    pub num_boxes: usize,
    /// Network input size of the step.
    pub input_size: u32,
}

/// Averaged losses of all steps run at one input size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LossSummary {
    /// Number of reported steps.
    pub count: usize,
    /// Mean of every loss term.
    pub mean: YoloLoss<f32>,
}

/// Accumulates loss reports per input size.
#[derive(Debug, Clone, Default)]
pub struct LossReporter {
    sums: BTreeMap<u32, (usize, YoloLoss<f32>)>,
}

impl LossReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the losses of one step.
    pub fn report(&mut self, report: &LossReport) {
        let (count, sum) = self.sums.entry(report.input_size).or_default();
        *count += 1;
        sum.total += report.losses.total;
        sum.no_object += report.losses.no_object;
        sum.object += report.losses.object;
        sum.coord += report.losses.coord;
        sum.class += report.losses.class;
    }

    /// Mean losses per input size, smallest size first.
    pub fn summary(&self) -> BTreeMap<u32, LossSummary> {
        self.sums
            .iter()
            .map(|(&input_size, &(count, sum))| {
                let n = count as f32;
                let mean = YoloLoss {
                    total: sum.total / n,
                    no_object: sum.no_object / n,
                    object: sum.object / n,
                    coord: sum.coord / n,
                    class: sum.class / n,
                };
                (input_size, LossSummary { count, mean })
            })
            .collect()
    }

    /// Forget all reported losses.
    pub fn reset(&mut self) {
        self.sums.clear();
    }
}
