use candle_core::{Result, Tensor};
use candle_nn::ops::leaky_relu;

use crate::config::TinyYolov2Config;

const LEAKY_SLOPE: f64 = 0.1;

/// Filters and bias of a convolution, filters laid out as `[out, in, kh, kw]`.
#[derive(Debug, Clone)]
pub struct ConvParams {
    /// Convolution filters.
    pub filters: Tensor,
    /// Per output channel bias.
    pub bias: Tensor,
}

impl ConvParams {
    fn forward(&self, xs: &Tensor, padding: usize) -> Result<Tensor> {
        xs.conv2d(&self.filters, padding, 1, 1, 1)?
            .broadcast_add(&per_channel(&self.bias)?)
    }
}

/// Folded batch normalization: `(x - sub) * truediv`.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    /// Subtracted per channel.
    pub sub: Tensor,
    /// Multiplied per channel.
    pub truediv: Tensor,
}

/// 3x3 convolution followed by batch normalization.
#[derive(Debug, Clone)]
pub struct ConvWithBatchNorm {
    /// The convolution.
    pub conv: ConvParams,
    /// The normalization applied before the bias.
    pub bn: BatchNorm,
}

/// Depthwise separable convolution.
#[derive(Debug, Clone)]
pub struct SeparableConvParams {
    /// Depthwise filters, `[in, 1, 3, 3]`.
    pub depthwise_filter: Tensor,
    /// Pointwise filters, `[out, in, 1, 1]`.
    pub pointwise_filter: Tensor,
    /// Per output channel bias.
    pub bias: Tensor,
}

/// A backbone layer, all variants end with a leaky relu.
#[derive(Debug, Clone)]
pub enum ConvLayer {
    /// Tiny YOLOv2 layer.
    WithBatchNorm(ConvWithBatchNorm),
    /// MobileNet layer.
    Separable(SeparableConvParams),
    /// Plain 3x3 convolution without padding, first layer of some MobileNet variants.
    Plain(ConvParams),
}

impl ConvLayer {
    /// Apply the layer to a `[batch, channels, height, width]` tensor.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = match self {
            ConvLayer::WithBatchNorm(params) => xs
                .conv2d(&params.conv.filters, 1, 1, 1, 1)?
                .broadcast_sub(&per_channel(&params.bn.sub)?)?
                .broadcast_mul(&per_channel(&params.bn.truediv)?)?
                .broadcast_add(&per_channel(&params.conv.bias)?)?,
            ConvLayer::Separable(params) => {
                let channels = xs.dim(1)?;
                xs.conv2d(&params.depthwise_filter, 1, 1, 1, channels)?
                    .conv2d(&params.pointwise_filter, 0, 1, 1, 1)?
                    .broadcast_add(&per_channel(&params.bias)?)?
            }
            ConvLayer::Plain(params) => params.forward(xs, 0)?,
        };
        leaky_relu(&out, LEAKY_SLOPE)
    }

    fn named_tensors<'a>(&'a self, prefix: &str) -> Vec<(String, &'a Tensor)> {
        match self {
            ConvLayer::WithBatchNorm(params) => vec![
                (format!("{prefix}/conv/filters"), &params.conv.filters),
                (format!("{prefix}/conv/bias"), &params.conv.bias),
                (format!("{prefix}/bn/sub"), &params.bn.sub),
                (format!("{prefix}/bn/truediv"), &params.bn.truediv),
            ],
            ConvLayer::Separable(params) => vec![
                (format!("{prefix}/depthwise_filter"), &params.depthwise_filter),
                (format!("{prefix}/pointwise_filter"), &params.pointwise_filter),
                (format!("{prefix}/bias"), &params.bias),
            ],
            ConvLayer::Plain(params) => vec![
                (format!("{prefix}/filters"), &params.filters),
                (format!("{prefix}/bias"), &params.bias),
            ],
        }
    }

    fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        match self {
            ConvLayer::WithBatchNorm(ConvWithBatchNorm { conv, bn }) => {
                vec![&mut conv.filters, &mut conv.bias, &mut bn.sub, &mut bn.truediv]
            }
            ConvLayer::Separable(params) => vec![
                &mut params.depthwise_filter,
                &mut params.pointwise_filter,
                &mut params.bias,
            ],
            ConvLayer::Plain(params) => vec![&mut params.filters, &mut params.bias],
        }
    }
}

/// Parameters of the whole network: the backbone layers and the 1x1 detection head.
#[derive(Debug, Clone)]
pub struct NetParams {
    /// Backbone layers, `conv0` first.
    pub layers: Vec<ConvLayer>,
    /// Detection head, always named `conv8`.
    pub head: ConvParams,
}

impl NetParams {
    /// Run the network on a `[batch, 3, size, size]` input.
    ///
    /// Returns `[batch, num_anchors * box_encoding_size, size / 32, size / 32]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut out = xs.clone();
        for (idx, layer) in self.layers.iter().enumerate() {
            out = layer.forward(&out)?;
            out = match idx {
                0..=4 => max_pool_same(&out, 2)?,
                5 => max_pool_same(&out, 1)?,
                _ => out,
            };
        }
        self.head.forward(&out, 0)
    }

    /// All parameters with their `<layer>/<param>` path, in serialization order.
    pub fn named_tensors(&self) -> Vec<(String, &Tensor)> {
        let mut tensors: Vec<_> = self
            .layers
            .iter()
            .enumerate()
            .flat_map(|(idx, layer)| layer.named_tensors(&format!("conv{idx}")))
            .collect();
        tensors.push(("conv8/filters".to_string(), &self.head.filters));
        tensors.push(("conv8/bias".to_string(), &self.head.bias));
        tensors
    }

    /// All parameters, in serialization order.
    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut tensors: Vec<_> = self
            .layers
            .iter_mut()
            .flat_map(|layer| layer.tensors_mut())
            .collect();
        tensors.push(&mut self.head.filters);
        tensors.push(&mut self.head.bias);
        tensors
    }

    /// Total number of weights.
    pub fn num_weights(&self) -> usize {
        self.named_tensors()
            .iter()
            .map(|(_, t)| t.elem_count())
            .sum()
    }
}

/// Which kind of layer the configuration asks for at every backbone position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LayerKind {
    WithBatchNorm,
    Separable,
    Plain,
}

/// Layer kinds with their input and output channels.
pub(crate) fn backbone_layout(config: &TinyYolov2Config) -> Vec<(LayerKind, usize, usize)> {
    config
        .filter_sizes()
        .windows(2)
        .enumerate()
        .map(|(idx, sizes)| {
            let kind = match (config.with_separable_convs, idx) {
                (false, _) => LayerKind::WithBatchNorm,
                (true, 0) if config.is_first_layer_conv2d() => LayerKind::Plain,
                (true, _) => LayerKind::Separable,
            };
            (kind, sizes[0], sizes[1])
        })
        .collect()
}

fn per_channel(t: &Tensor) -> Result<Tensor> {
    let channels = t.dim(0)?;
    t.reshape((1, channels, 1, 1))
}

/// 2x2 max pooling with "same" padding on the bottom and right edges, stride 1 or 2.
fn max_pool_same(xs: &Tensor, stride: usize) -> Result<Tensor> {
    let (_, _, height, width) = xs.dims4()?;
    let padding = |size: usize| ((size.div_ceil(stride) - 1) * stride + 2).saturating_sub(size);
    let (pad_h, pad_w) = (padding(height), padding(width));
    let padded = xs
        .pad_with_same(2, pad_h / 2, pad_h - pad_h / 2)?
        .pad_with_same(3, pad_w / 2, pad_w - pad_w / 2)?;
    if stride != 1 {
        return padded.max_pool2d_with_stride(2, stride);
    }

    // candle has no gradient for overlapping pooling windows
    let window = |dy: usize, dx: usize| padded.narrow(2, dy, height)?.narrow(3, dx, width);
    window(0, 0)?
        .maximum(&window(0, 1)?)?
        .maximum(&window(1, 0)?)?
        .maximum(&window(1, 1)?)
}
