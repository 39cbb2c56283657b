use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::config::TinyYolov2Config;
use crate::error::TinyYolov2Error;
use crate::model::{
    BatchNorm, ConvLayer, ConvParams, ConvWithBatchNorm, LayerKind, NetParams,
    SeparableConvParams, backbone_layout,
};

/// A source of named network parameters.
pub trait ParamSource {
    /// Take the parameter stored under `path`, which must have the given shape.
    fn extract(&mut self, path: &str, shape: &[usize]) -> Result<Tensor, TinyYolov2Error>;

    /// Called once every parameter has been extracted, fails on leftovers.
    fn finish(self) -> Result<(), TinyYolov2Error>;
}

/// Memory order of the convolution filters in a flat buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterLayout {
    /// `[out, in, kh, kw]`, depthwise filters `[in, 1, kh, kw]`. Written by [`to_flat_weights`].
    #[default]
    ChannelsFirst,
    /// `[kh, kw, in, out]`, depthwise filters `[kh, kw, in, 1]`, as exported from tensorflow.
    ChannelsLast,
}

/// Parameters stored back to back in a single buffer.
///
/// Filters are read as [`FilterLayout::ChannelsFirst`] unless another layout is set.
/// Buffers in tensorflow order have the same length, so loading them with the wrong
/// layout succeeds and yields a broken network.
pub struct FlatWeights<'a> {
    weights: &'a [f32],
    offset: usize,
    device: &'a Device,
    layout: FilterLayout,
}

impl<'a> FlatWeights<'a> {
    /// Wrap a flat weight buffer.
    pub fn new(weights: &'a [f32], device: &'a Device) -> Self {
        Self {
            weights,
            offset: 0,
            device,
            layout: FilterLayout::default(),
        }
    }

    /// Read the filters in the given layout.
    pub fn with_filter_layout(mut self, layout: FilterLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Number of weights not consumed yet.
    pub fn remaining(&self) -> usize {
        self.weights.len() - self.offset
    }
}

impl ParamSource for FlatWeights<'_> {
    fn extract(&mut self, path: &str, shape: &[usize]) -> Result<Tensor, TinyYolov2Error> {
        let count: usize = shape.iter().product();
        if count > self.remaining() {
            return Err(TinyYolov2Error::config(format!(
                "weight buffer too short: {path} needs {count} weights, {} left",
                self.remaining()
            )));
        }
        let values = &self.weights[self.offset..self.offset + count];
        self.offset += count;

        match (self.layout, shape) {
            (FilterLayout::ChannelsLast, &[out, cin, kh, kw]) => {
                let tensor = if path.ends_with("depthwise_filter") {
                    // [kh, kw, in, 1] -> [in, 1, kh, kw]
                    Tensor::from_slice(values, (kh, kw, out, cin), self.device)?
                        .permute((2, 3, 0, 1))?
                } else {
                    Tensor::from_slice(values, (kh, kw, cin, out), self.device)?
                        .permute((3, 2, 0, 1))?
                };
                Ok(tensor.contiguous()?)
            }
            _ => Ok(Tensor::from_slice(values, shape, self.device)?),
        }
    }

    fn finish(self) -> Result<(), TinyYolov2Error> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(TinyYolov2Error::config(format!(
                "weights remaining after extract: {remaining}"
            ))),
        }
    }
}

/// Parameters keyed by `<layer>/<param>` paths, e.g. `conv0/conv/filters`.
pub struct WeightMap {
    entries: HashMap<String, Tensor>,
}

impl WeightMap {
    /// Wrap a map of named tensors.
    pub fn new(entries: HashMap<String, Tensor>) -> Self {
        Self { entries }
    }

    /// Read every tensor of a safetensors file.
    pub fn from_safetensors(
        path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self, TinyYolov2Error> {
        Ok(Self::new(candle_core::safetensors::load(path, device)?))
    }
}

impl ParamSource for WeightMap {
    fn extract(&mut self, path: &str, shape: &[usize]) -> Result<Tensor, TinyYolov2Error> {
        let tensor = self.entries.remove(path).ok_or_else(|| {
            TinyYolov2Error::config(format!("no weight entry found for: {path}"))
        })?;
        if tensor.dims() != shape {
            return Err(TinyYolov2Error::config(format!(
                "weight entry {path} has shape {:?}, expected {shape:?}",
                tensor.dims()
            )));
        }
        Ok(tensor)
    }

    fn finish(self) -> Result<(), TinyYolov2Error> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let mut unused: Vec<_> = self.entries.into_keys().collect();
        unused.sort();
        Err(TinyYolov2Error::config(format!(
            "unused weight entries: {}",
            unused.join(", ")
        )))
    }
}

/// Build the network parameters described by `config` from `source`.
pub fn extract_params<S: ParamSource>(
    config: &TinyYolov2Config,
    mut source: S,
) -> Result<NetParams, TinyYolov2Error> {
    let mut layers = Vec::new();
    for (idx, (kind, channels_in, channels_out)) in backbone_layout(config).into_iter().enumerate()
    {
        let prefix = format!("conv{idx}");
        let layer = match kind {
            LayerKind::WithBatchNorm => ConvLayer::WithBatchNorm(ConvWithBatchNorm {
                conv: extract_conv(&mut source, &format!("{prefix}/conv"), channels_in, channels_out, 3)?,
                bn: BatchNorm {
                    sub: source.extract(&format!("{prefix}/bn/sub"), &[channels_out])?,
                    truediv: source.extract(&format!("{prefix}/bn/truediv"), &[channels_out])?,
                },
            }),
            LayerKind::Separable => ConvLayer::Separable(SeparableConvParams {
                depthwise_filter: source.extract(
                    &format!("{prefix}/depthwise_filter"),
                    &[channels_in, 1, 3, 3],
                )?,
                pointwise_filter: source.extract(
                    &format!("{prefix}/pointwise_filter"),
                    &[channels_out, channels_in, 1, 1],
                )?,
                bias: source.extract(&format!("{prefix}/bias"), &[channels_out])?,
            }),
            LayerKind::Plain => {
                ConvLayer::Plain(extract_conv(&mut source, &prefix, channels_in, channels_out, 3)?)
            }
        };
        layers.push(layer);
    }

    let last = config.filter_sizes().last().copied().unwrap_or_default();
    let head_channels = config.num_anchors() * config.box_encoding_size();
    let head = extract_conv(&mut source, "conv8", last, head_channels, 1)?;

    source.finish()?;
    Ok(NetParams { layers, head })
}

fn extract_conv<S: ParamSource>(
    source: &mut S,
    prefix: &str,
    channels_in: usize,
    channels_out: usize,
    kernel: usize,
) -> Result<ConvParams, TinyYolov2Error> {
    Ok(ConvParams {
        filters: source.extract(
            &format!("{prefix}/filters"),
            &[channels_out, channels_in, kernel, kernel],
        )?,
        bias: source.extract(&format!("{prefix}/bias"), &[channels_out])?,
    })
}

/// Number of weights of the network described by `config`.
pub fn num_weights(config: &TinyYolov2Config) -> usize {
    let backbone: usize = backbone_layout(config)
        .into_iter()
        .map(|(kind, cin, cout)| match kind {
            LayerKind::WithBatchNorm => 9 * cin * cout + 3 * cout,
            LayerKind::Separable => 9 * cin + cin * cout + cout,
            LayerKind::Plain => 9 * cin * cout + cout,
        })
        .sum();
    let last = config.filter_sizes().last().copied().unwrap_or_default();
    let head = config.num_anchors() * config.box_encoding_size();
    backbone + last * head + head
}

/// Flatten the parameters into a single buffer, loadable with [`FlatWeights`].
pub fn to_flat_weights(params: &NetParams) -> Result<Vec<f32>, TinyYolov2Error> {
    let mut weights = Vec::with_capacity(params.num_weights());
    for (_, tensor) in params.named_tensors() {
        weights.extend(tensor.flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(weights)
}

/// The parameters as a map keyed by their `<layer>/<param>` paths.
pub fn to_weight_map(params: &NetParams) -> HashMap<String, Tensor> {
    params
        .named_tensors()
        .into_iter()
        .map(|(path, tensor)| (path, tensor.clone()))
        .collect()
}
