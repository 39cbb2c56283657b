#![deny(missing_docs)]

//! Tiny YOLOv2 object detection in Rust
//!
//! This crate provides the Tiny YOLOv2 and MobileNet style detectors: box decoding,
//! non-maximum suppression, and the training loss with its anchor assignment.
//!
//! # Examples
//!
//! ```no_run
//! use candle_core::Device;
//! use kornia_tiny_yolov2::{DetectOptions, InputSize, TinyYolov2, TinyYolov2Config};
//!
//! let mut model = TinyYolov2::new(TinyYolov2Config::default(), Device::Cpu)
//!     .expect("Failed to create Tiny YOLOv2 model");
//! model
//!     .load_safetensors("path/to/tiny_yolov2.safetensors")
//!     .expect("Failed to load weights");
//!
//! let image = kornia_io::functional::read_image_any("path/to/image.jpg")
//!     .expect("Failed to read image");
//!
//! let options = DetectOptions {
//!     input_size: InputSize::Md,
//!     score_threshold: 0.5,
//! };
//! let detections = model.detect(&image, &options).expect("Failed to run inference");
//! for detection in detections {
//!     println!("Detection: {:?}", detection);
//! }
//! ```

/// Ground truth boxes and their assignment to grid cells and anchors
mod assignment;

/// Bounding boxes, IoU and non-maximum suppression
mod bounding_box;

/// Detector and training configuration
mod config;

/// Decoding of the raw output grid into boxes
mod decoder;

/// Detection results
mod detection;

/// Error types
mod error;

/// Training loss
mod loss;

/// Masks selecting the outputs of every loss term
mod masks;

/// Backbone layers in candle
mod model;

/// Loss reports of training steps
mod report;

/// Tiny YOLOv2 high level interface
mod tiny_yolov2;

/// Tiny YOLOv2 training interface
mod trainable;

/// Weight loading and export
mod weights;

pub use assignment::{
    GroundTruth, GroundTruthWithGridPosition, assign_ground_truth_to_anchors,
    filter_ground_truth_boxes, validate_ground_truth,
};
pub use bounding_box::{BoundingBox, Dimensions, Rect, iou, non_maximum_suppression};
pub use config::{
    Anchor, CELL_SIZE, DEFAULT_FILTER_SIZES, DetectOptions, InputSize, TinyYolov2Config,
    TinyYolov2TrainableConfig, num_cells,
};
pub use decoder::{DecodedBox, GridBoxDecoder, GridPosition};
pub use detection::ObjectDetection;
pub use error::TinyYolov2Error;
pub use loss::TinyYolov2LossFunction;
pub use masks::{GridShape, LossMasks};
pub use model::{
    BatchNorm, ConvLayer, ConvParams, ConvWithBatchNorm, NetParams, SeparableConvParams,
};
pub use report::{LossReport, LossReporter, LossSummary, YoloLoss};
pub use tiny_yolov2::{TinyYolov2, reshaped_size};
pub use trainable::{BackwardOptions, TinyYolov2Trainable};
pub use weights::{
    FilterLayout, FlatWeights, ParamSource, WeightMap, extract_params, num_weights,
    to_flat_weights, to_weight_map,
};
