use serde::Serialize;

use crate::bounding_box::{Dimensions, Rect};

/// A detected object in absolute image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDetection {
    /// Objectness of the box.
    pub score: f32,
    /// Objectness times the probability of the class.
    pub class_score: f32,
    /// Name of the most likely class.
    pub class_name: String,
    /// Box in pixels of the input image.
    pub bbox: Rect,
    /// Width of the input image.
    pub image_width: u32,
    /// Height of the input image.
    pub image_height: u32,
}

impl ObjectDetection {
    /// Create a detection from a box relative to an image of the given size.
    pub fn new(
        score: f32,
        class_score: f32,
        class_name: impl Into<String>,
        relative_box: Rect,
        image_width: u32,
        image_height: u32,
    ) -> Self {
        let bbox = relative_box.rescale(Dimensions::new(image_width as f32, image_height as f32));
        Self {
            score,
            class_score,
            class_name: class_name.into(),
            bbox,
            image_width,
            image_height,
        }
    }

    /// The image dimensions.
    pub fn image_dims(&self) -> Dimensions {
        Dimensions::new(self.image_width as f32, self.image_height as f32)
    }

    /// The box relative to the image size.
    pub fn relative_box(&self) -> Rect {
        self.bbox.rescale_between(self.image_dims(), Dimensions::unit())
    }

    /// The same detection projected onto an image of another size.
    pub fn for_size(&self, width: u32, height: u32) -> Self {
        Self::new(
            self.score,
            self.class_score,
            self.class_name.clone(),
            self.relative_box(),
            width,
            height,
        )
    }
}
