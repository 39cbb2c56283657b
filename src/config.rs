use serde::{Deserialize, Serialize};

use crate::error::TinyYolov2Error;

/// Total downsampling stride of the backbone, i.e. the side of a grid cell in pixels.
pub const CELL_SIZE: u32 = 32;

/// Filter sizes of the default Tiny YOLOv2 backbone.
pub const DEFAULT_FILTER_SIZES: [usize; 9] = [3, 16, 32, 64, 128, 256, 512, 1024, 1024];

/// Number of grid cells per side for a square input of `input_size` pixels.
pub fn num_cells(input_size: u32) -> usize {
    (input_size / CELL_SIZE) as usize
}

/// Prior box shape, in grid cell units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// Width in grid cells.
    pub x: f32,
    /// Height in grid cells.
    pub y: f32,
}

impl Anchor {
    /// Create a new anchor.
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Tiny YOLOv2 configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TinyYolov2Config {
    /// Use the depthwise separable (MobileNet style) backbone.
    #[serde(alias = "useSeparableConvs")]
    pub with_separable_convs: bool,
    /// The non-maximum suppression threshold, in [0, 1].
    pub iou_threshold: f32,
    /// Prior box shapes, one per prediction slot of a grid cell.
    pub anchors: Vec<Anchor>,
    /// Class names, indexed by label.
    pub classes: Vec<String>,
    /// Per channel mean subtracted from the input.
    #[serde(default)]
    pub mean_rgb: Option<[f32; 3]>,
    /// Predict class scores even for a single class.
    #[serde(default)]
    pub with_class_scores: Option<bool>,
    /// Channel counts of the backbone, input channels first.
    #[serde(default)]
    pub filter_sizes: Option<Vec<usize>>,
    /// Use a plain convolution as first layer of the separable backbone.
    #[serde(default)]
    pub is_first_layer_conv2d: Option<bool>,
}

/// Default configuration: single class face detector anchors.
impl Default for TinyYolov2Config {
    fn default() -> Self {
        Self {
            with_separable_convs: false,
            iou_threshold: 0.4,
            anchors: vec![
                Anchor::new(0.738768, 0.874946),
                Anchor::new(2.42204, 2.65704),
                Anchor::new(4.30971, 7.04493),
                Anchor::new(10.246, 4.59428),
                Anchor::new(12.6868, 11.8741),
            ],
            classes: vec!["face".to_string()],
            mean_rgb: None,
            with_class_scores: None,
            filter_sizes: None,
            is_first_layer_conv2d: None,
        }
    }
}

impl TinyYolov2Config {
    /// Parse a configuration from json and validate it.
    pub fn from_json(json: &str) -> Result<Self, TinyYolov2Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for invalid values.
    pub fn validate(&self) -> Result<(), TinyYolov2Error> {
        if self.classes.is_empty() {
            return Err(TinyYolov2Error::config(
                "config.classes has to be a non empty list of class names",
            ));
        }

        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(TinyYolov2Error::config(format!(
                "config.iouThreshold has to be a number between [0, 1], have: {}",
                self.iou_threshold
            )));
        }

        if self.anchors.is_empty()
            || self
                .anchors
                .iter()
                .any(|a| !(a.x.is_finite() && a.y.is_finite() && a.x > 0.0 && a.y > 0.0))
        {
            return Err(TinyYolov2Error::config(format!(
                "config.anchors has to be a non empty list of positive {{ x, y }}, have: {:?}",
                self.anchors
            )));
        }

        if let Some(mean_rgb) = self.mean_rgb {
            if mean_rgb.iter().any(|m| !m.is_finite()) {
                return Err(TinyYolov2Error::config(format!(
                    "config.meanRgb has to contain finite numbers, have: {mean_rgb:?}"
                )));
            }
        }

        let filter_sizes = self.filter_sizes();
        let num_filters = filter_sizes.len();
        if !(7..=9).contains(&num_filters) {
            return Err(TinyYolov2Error::config(format!(
                "expected 7 | 8 | 9 convolutional filters, but found {num_filters} filterSizes in config"
            )));
        }
        if !self.with_separable_convs && num_filters != 9 {
            return Err(TinyYolov2Error::config(format!(
                "the tiny yolov2 backbone needs 9 filterSizes, found {num_filters}"
            )));
        }
        if filter_sizes.contains(&0) {
            return Err(TinyYolov2Error::config("config.filterSizes must be positive"));
        }

        Ok(())
    }

    /// Whether the encoding of a box carries class scores.
    pub fn with_class_scores(&self) -> bool {
        self.with_class_scores.unwrap_or(false) || self.classes.len() > 1
    }

    /// Number of values encoding a single box: 4 box values, objectness and the class scores.
    pub fn box_encoding_size(&self) -> usize {
        5 + if self.with_class_scores() {
            self.classes.len()
        } else {
            0
        }
    }

    /// Number of prediction slots per grid cell.
    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }

    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// The configured filter sizes or the default ones.
    pub fn filter_sizes(&self) -> &[usize] {
        self.filter_sizes.as_deref().unwrap_or(&DEFAULT_FILTER_SIZES)
    }

    /// Whether the separable backbone starts with a plain convolution.
    pub fn is_first_layer_conv2d(&self) -> bool {
        self.is_first_layer_conv2d.unwrap_or(false)
    }
}

/// Training configuration: the detector configuration plus the loss term scales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TinyYolov2TrainableConfig {
    /// The detector configuration.
    #[serde(flatten)]
    pub model: TinyYolov2Config,
    /// Scale of the loss on objectness where no object is assigned.
    pub no_object_scale: f32,
    /// Scale of the loss on objectness where an object is assigned.
    pub object_scale: f32,
    /// Scale of the box offset and size loss.
    pub coord_scale: f32,
    /// Scale of the class score loss.
    pub class_scale: f32,
}

impl Default for TinyYolov2TrainableConfig {
    fn default() -> Self {
        Self {
            model: TinyYolov2Config::default(),
            no_object_scale: 1.0,
            object_scale: 5.0,
            coord_scale: 1.0,
            class_scale: 1.0,
        }
    }
}

impl TinyYolov2TrainableConfig {
    /// Parse a training configuration from json and validate it.
    pub fn from_json(json: &str) -> Result<Self, TinyYolov2Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the detector configuration and the loss scales.
    pub fn validate(&self) -> Result<(), TinyYolov2Error> {
        self.model.validate()?;

        for (name, scale) in [
            ("noObjectScale", self.no_object_scale),
            ("objectScale", self.object_scale),
            ("coordScale", self.coord_scale),
            ("classScale", self.class_scale),
        ] {
            if !scale.is_finite() || scale < 0.0 {
                return Err(TinyYolov2Error::config(format!(
                    "config.{name} has to be a non negative number, have: {scale}"
                )));
            }
        }

        Ok(())
    }
}

/// Input size of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputSize {
    /// 224 pixels.
    Xs,
    /// 320 pixels.
    Sm,
    /// 416 pixels.
    #[default]
    Md,
    /// 608 pixels.
    Lg,
    /// Any positive multiple of [`CELL_SIZE`].
    Custom(u32),
}

impl InputSize {
    /// The side of the square network input in pixels.
    pub fn size(&self) -> Result<u32, TinyYolov2Error> {
        let size = match self {
            InputSize::Xs => 224,
            InputSize::Sm => 320,
            InputSize::Md => 416,
            InputSize::Lg => 608,
            InputSize::Custom(size) => *size,
        };
        if size == 0 || size % CELL_SIZE != 0 {
            return Err(TinyYolov2Error::config(format!(
                "unknown inputSize: {size}, expected a multiple of {CELL_SIZE} or one of xs | sm | md | lg"
            )));
        }
        Ok(size)
    }
}

impl From<u32> for InputSize {
    fn from(size: u32) -> Self {
        InputSize::Custom(size)
    }
}

impl TryFrom<&str> for InputSize {
    type Error = TinyYolov2Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let size = match s {
            "xs" => InputSize::Xs,
            "sm" => InputSize::Sm,
            "md" => InputSize::Md,
            "lg" => InputSize::Lg,
            _ => {
                let size = s.parse::<u32>().map_err(|_| {
                    TinyYolov2Error::config(format!(
                        "unknown inputSize: {s}, expected number or one of xs | sm | md | lg"
                    ))
                })?;
                InputSize::Custom(size)
            }
        };
        size.size()?;
        Ok(size)
    }
}

impl std::fmt::Display for InputSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSize::Xs => write!(f, "xs"),
            InputSize::Sm => write!(f, "sm"),
            InputSize::Md => write!(f, "md"),
            InputSize::Lg => write!(f, "lg"),
            InputSize::Custom(size) => write!(f, "{size}"),
        }
    }
}

/// Options of a detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    /// Network input size.
    pub input_size: InputSize,
    /// Minimum objectness of a box, in (0, 1).
    pub score_threshold: f32,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            input_size: InputSize::Md,
            score_threshold: 0.5,
        }
    }
}

impl DetectOptions {
    /// Check the options, returning the input size in pixels.
    pub fn validate(&self) -> Result<u32, TinyYolov2Error> {
        if !(self.score_threshold > 0.0 && self.score_threshold < 1.0) {
            return Err(TinyYolov2Error::config(format!(
                "expected scoreThreshold to be a number between 0 and 1, have: {}",
                self.score_threshold
            )));
        }
        self.input_size.size()
    }
}
