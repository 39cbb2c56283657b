use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use kornia_image::{Image, ImageSize};

use crate::bounding_box::{Dimensions, non_maximum_suppression};
use crate::config::{DetectOptions, TinyYolov2Config};
use crate::decoder::{DecodedBox, GridBoxDecoder};
use crate::detection::ObjectDetection;
use crate::error::TinyYolov2Error;
use crate::model::NetParams;
use crate::weights::{FilterLayout, FlatWeights, WeightMap, extract_params, to_flat_weights};

/// Tiny YOLOv2 high level interface.
pub struct TinyYolov2 {
    config: TinyYolov2Config,
    device: Device,
    decoder: GridBoxDecoder,
    params: Option<NetParams>,
}

impl TinyYolov2 {
    /// Create a new detector, weights have to be loaded before inference.
    pub fn new(config: TinyYolov2Config, device: Device) -> Result<Self, TinyYolov2Error> {
        config.validate()?;
        Ok(Self {
            decoder: GridBoxDecoder::new(&config),
            config,
            device,
            params: None,
        })
    }

    /// The detector configuration.
    pub fn config(&self) -> &TinyYolov2Config {
        &self.config
    }

    /// The device the network runs on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The loaded network parameters.
    pub fn params(&self) -> Result<&NetParams, TinyYolov2Error> {
        self.params
            .as_ref()
            .ok_or_else(|| TinyYolov2Error::config("load model before inference"))
    }

    pub(crate) fn params_mut(&mut self) -> Result<&mut NetParams, TinyYolov2Error> {
        self.params
            .as_mut()
            .ok_or_else(|| TinyYolov2Error::config("load model before inference"))
    }

    /// Whether weights have been loaded.
    pub fn is_loaded(&self) -> bool {
        self.params.is_some()
    }

    /// Load the weights from a flat buffer with channel first filters.
    pub fn load_weights(&mut self, weights: &[f32]) -> Result<(), TinyYolov2Error> {
        self.load_weights_with_layout(weights, FilterLayout::ChannelsFirst)
    }

    /// Load the weights from a flat buffer with filters in the given layout.
    pub fn load_weights_with_layout(
        &mut self,
        weights: &[f32],
        layout: FilterLayout,
    ) -> Result<(), TinyYolov2Error> {
        let source = FlatWeights::new(weights, &self.device).with_filter_layout(layout);
        let params = extract_params(&self.config, source)?;
        self.set_params(params);
        Ok(())
    }

    /// Load the weights from tensors keyed by `<layer>/<param>`.
    pub fn load_weight_map(
        &mut self,
        weights: HashMap<String, Tensor>,
    ) -> Result<(), TinyYolov2Error> {
        let params = extract_params(&self.config, WeightMap::new(weights))?;
        self.set_params(params);
        Ok(())
    }

    /// Load the weights from a safetensors file.
    pub fn load_safetensors(&mut self, path: impl AsRef<Path>) -> Result<(), TinyYolov2Error> {
        tracing::debug!("loading weights from {}", path.as_ref().display());
        let params = extract_params(
            &self.config,
            WeightMap::from_safetensors(path, &self.device)?,
        )?;
        self.set_params(params);
        Ok(())
    }

    /// Download a safetensors file from the Hugging Face hub, if not cached yet, and load it.
    pub fn load_from_hub(&mut self, repo: &str, filename: &str) -> Result<(), TinyYolov2Error> {
        let path = hf_hub::api::sync::Api::new()?
            .model(repo.to_string())
            .get(filename)?;
        self.load_safetensors(path)
    }

    /// The loaded weights as a flat buffer, loadable with [`TinyYolov2::load_weights`].
    pub fn save_weights(&self) -> Result<Vec<f32>, TinyYolov2Error> {
        to_flat_weights(self.params()?)
    }

    fn set_params(&mut self, params: NetParams) {
        tracing::debug!(
            "loaded {} weights, separable convs: {}",
            params.num_weights(),
            self.config.with_separable_convs
        );
        self.params = Some(params);
    }

    /// Detect objects in an rgb8 image.
    ///
    /// Returns the detections left after non-maximum suppression, highest objectness first.
    pub fn detect(
        &self,
        image: &Image<u8, 3>,
        options: &DetectOptions,
    ) -> Result<Vec<ObjectDetection>, TinyYolov2Error> {
        let input_size = options.validate()?;
        let (input, reshaped_dims) = self.preprocess(image, input_size)?;
        let output = self.forward_input(&input)?;
        let boxes = self.extract_boxes(&output, reshaped_dims, Some(options.score_threshold))?;

        let input_dims = Dimensions::square(input_size as f32);
        let picked = non_maximum_suppression(
            &boxes
                .iter()
                .map(|b| b.bbox.rescale(input_dims))
                .collect::<Vec<_>>(),
            &boxes.iter().map(|b| b.score).collect::<Vec<_>>(),
            self.config.iou_threshold,
            true,
        );
        tracing::debug!(
            "{} boxes above score threshold, {} after nms",
            boxes.len(),
            picked.len()
        );

        let (width, height) = (image.width() as u32, image.height() as u32);
        Ok(picked
            .into_iter()
            .map(|idx| {
                let b = &boxes[idx];
                let class_name = self
                    .config
                    .classes
                    .get(b.label)
                    .cloned()
                    .unwrap_or_default();
                ObjectDetection::new(b.score, b.class_score, class_name, b.bbox.to_rect(), width, height)
            })
            .collect())
    }

    /// Preprocess an image and run the network on it.
    ///
    /// Returns the raw output grid and the size of the image after the aspect keeping resize.
    pub fn forward(
        &self,
        image: &Image<u8, 3>,
        input_size: u32,
    ) -> Result<(Tensor, Dimensions), TinyYolov2Error> {
        let (input, reshaped_dims) = self.preprocess(image, input_size)?;
        Ok((self.forward_input(&input)?, reshaped_dims))
    }

    /// Run the network on a preprocessed `[1, 3, size, size]` tensor.
    ///
    /// Returns the channels last grid `[1, cells, cells, anchors * encoding]`.
    pub fn forward_input(&self, input: &Tensor) -> Result<Tensor, TinyYolov2Error> {
        let out = self.params()?.forward(input)?;
        Ok(out.permute((0, 2, 3, 1))?.contiguous()?)
    }

    /// Decode the raw output grid into boxes, see [`GridBoxDecoder::decode`].
    pub fn extract_boxes(
        &self,
        output: &Tensor,
        reshaped_dims: Dimensions,
        score_threshold: Option<f32>,
    ) -> Result<Vec<DecodedBox>, TinyYolov2Error> {
        self.decoder.decode(output, reshaped_dims, score_threshold)
    }

    /// Resize keeping the aspect ratio, pad to a square of `input_size` and normalize.
    ///
    /// Returns the `[1, 3, input_size, input_size]` input and the size of the resized
    /// image before padding.
    pub fn preprocess(
        &self,
        image: &Image<u8, 3>,
        input_size: u32,
    ) -> Result<(Tensor, Dimensions), TinyYolov2Error> {
        let size = ImageSize {
            width: image.width(),
            height: image.height(),
        };
        if size.width == 0 || size.height == 0 {
            return Err(TinyYolov2Error::config("empty input image"));
        }
        let reshaped = reshaped_size(size, input_size as usize);

        let mut resized = Image::from_size_val(reshaped, 0)?;
        kornia_imgproc::resize::resize_fast(
            image,
            &mut resized,
            kornia_imgproc::interpolation::InterpolationMode::Bilinear,
        )?;

        // pad right and bottom with zeros
        let side = input_size as usize;
        let mut padded = vec![0f32; side * side * 3];
        let row_len = reshaped.width * 3;
        for (y, row) in resized.as_slice().chunks_exact(row_len).enumerate() {
            let start = y * side * 3;
            padded[start..start + row_len]
                .iter_mut()
                .zip(row)
                .for_each(|(dst, &src)| *dst = src as f32);
        }

        let mut input = Tensor::from_vec(padded, (side, side, 3), &self.device)?;
        if let Some(mean_rgb) = self.config.mean_rgb {
            input = input.broadcast_sub(&Tensor::new(&mean_rgb, &self.device)?)?;
        }
        let input = input
            .affine(1. / 256., 0.)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .contiguous()?;

        Ok((
            input,
            Dimensions::new(reshaped.width as f32, reshaped.height as f32),
        ))
    }
}

/// Size of the image once its longer side is scaled to `input_size`.
pub fn reshaped_size(size: ImageSize, input_size: usize) -> ImageSize {
    let scale = input_size as f32 / size.width.max(size.height) as f32;
    let scaled = |dim: usize| ((dim as f32 * scale).round() as usize).max(1);
    ImageSize {
        width: scaled(size.width),
        height: scaled(size.height),
    }
}
