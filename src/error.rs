/// Tiny YOLOv2 error enum.
#[derive(thiserror::Error, Debug)]
pub enum TinyYolov2Error {
    /// Invalid configuration: anchors, thresholds, input size, filter sizes or weights.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Invalid ground truth data passed to a training step.
    #[error("invalid ground truth data: {0}")]
    Data(String),

    /// Contract violation between anchor assignment and box decoding.
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    /// Internal candle error.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Kornia image error.
    #[error(transparent)]
    KorniaImageError(#[from] kornia_image::ImageError),

    /// Hugging Face API error.
    #[error(transparent)]
    ApiError(#[from] hf_hub::api::sync::ApiError),

    /// Configuration file could not be parsed.
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl TinyYolov2Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}
