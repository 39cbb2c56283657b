use serde::{Deserialize, Serialize};

/// Width and height of an image or of a coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: f32,
    /// Height in pixels.
    pub height: f32,
}

impl Dimensions {
    /// Create new dimensions.
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// A square coordinate space of the given side.
    pub fn square(size: f32) -> Self {
        Self::new(size, size)
    }

    /// The unit square, i.e. relative coordinates.
    pub fn unit() -> Self {
        Self::square(1.0)
    }

    /// The longer side.
    pub fn max_side(&self) -> f32 {
        self.width.max(self.height)
    }
}

/// Box given by its top left corner and its size.
///
/// Depending on the context the values are either relative (0-1) or absolute pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width, never negative.
    pub width: f32,
    /// Height, never negative.
    pub height: f32,
}

impl Rect {
    /// Create a new rect, negative sizes are clamped to zero.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Convert to corner representation.
    pub fn to_bounding_box(&self) -> BoundingBox {
        BoundingBox::new(self.x, self.y, self.x + self.width, self.y + self.height)
    }

    /// Center of the rect.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Scale every field by `sx` horizontally and `sy` vertically.
    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x * sx, self.y * sy, self.width * sx, self.height * sy)
    }

    /// Map a relative rect into the coordinate space given by `dims`.
    pub fn rescale(&self, dims: Dimensions) -> Self {
        self.scale(dims.width, dims.height)
    }

    /// Map a rect from one coordinate space into another.
    pub fn rescale_between(&self, from: Dimensions, to: Dimensions) -> Self {
        self.scale(to.width / from.width, to.height / from.height)
    }

    /// Area of the rect.
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

impl From<BoundingBox> for Rect {
    fn from(bbox: BoundingBox) -> Self {
        bbox.to_rect()
    }
}

/// Box given by its four edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub left: f32,
    /// Top edge.
    pub top: f32,
    /// Right edge.
    pub right: f32,
    /// Bottom edge.
    pub bottom: f32,
}

impl BoundingBox {
    /// Create a new bounding box from its edges.
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Width of the box.
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    /// Height of the box.
    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Area of the box, zero for degenerate boxes.
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Convert to top left corner plus size.
    pub fn to_rect(&self) -> Rect {
        Rect::new(self.left, self.top, self.width(), self.height())
    }

    /// Map a relative box into the coordinate space given by `dims`.
    pub fn rescale(&self, dims: Dimensions) -> Self {
        Self::new(
            self.left * dims.width,
            self.top * dims.height,
            self.right * dims.width,
            self.bottom * dims.height,
        )
    }

    /// Map a box from one coordinate space into another.
    pub fn rescale_between(&self, from: Dimensions, to: Dimensions) -> Self {
        self.rescale(Dimensions::new(
            to.width / from.width,
            to.height / from.height,
        ))
    }
}

impl From<Rect> for BoundingBox {
    fn from(rect: Rect) -> Self {
        rect.to_bounding_box()
    }
}

/// Intersection over union of two bounding boxes.
///
/// Boxes which only touch along an edge do not overlap.
pub fn iou(b1: &BoundingBox, b2: &BoundingBox) -> f32 {
    let i_width = (b1.right.min(b2.right) - b1.left.max(b2.left)).max(0.);
    let i_height = (b1.bottom.min(b2.bottom) - b1.top.max(b2.top)).max(0.);
    let i_area = i_width * i_height;
    let union = b1.area() + b2.area() - i_area;
    if union <= 0. {
        return 0.;
    }
    i_area / union
}

/// Non-maximum suppression for bounding boxes.
///
/// Greedily picks the box with the highest remaining score and drops every other box
/// whose IoU with it exceeds `threshold`. Equal scores are resolved by input order.
///
/// # Arguments
///
/// * `boxes` - Boxes, all in the same coordinate space.
/// * `scores` - One score per box.
/// * `threshold` - The IoU threshold for suppression.
/// * `sorted` - Return the picked indices by descending score instead of by index.
///
/// # Returns
///
/// The indices of the picked boxes.
pub fn non_maximum_suppression(
    boxes: &[BoundingBox],
    scores: &[f32],
    threshold: f32,
    sorted: bool,
) -> Vec<usize> {
    let n = boxes.len().min(scores.len());

    // stable sort keeps the input order among equal scores
    let mut idxs: Vec<usize> = (0..n).collect();
    idxs.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut picked = Vec::new();
    let mut remaining = idxs;
    while !remaining.is_empty() {
        let best = remaining.remove(0);
        picked.push(best);
        remaining.retain(|&idx| iou(&boxes[best], &boxes[idx]) <= threshold);
    }

    if !sorted {
        picked.sort_unstable();
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        Rect::new(x, y, w, h).to_bounding_box()
    }

    #[test]
    fn test_iou_identical() {
        let b = bbox(0., 0., 20., 20.);
        assert_eq!(iou(&b, &b), 1.0);
    }

    #[test]
    fn test_iou_touching_is_zero() {
        assert_eq!(iou(&bbox(0., 0., 20., 20.), &bbox(20., 20., 20., 20.)), 0.0);
        assert_eq!(iou(&bbox(0., 0., 10., 10.), &bbox(50., 0., 10., 10.)), 0.0);
    }

    #[test]
    fn test_iou_half() {
        let b1 = bbox(0., 0., 20., 20.);
        assert_eq!(iou(&b1, &bbox(0., 0., 10., 20.)), 0.5);
        assert_eq!(iou(&b1, &bbox(0., 10., 20., 10.)), 0.5);
    }

    #[test]
    fn test_iou_symmetric() {
        let b1 = bbox(3., 4., 17., 9.);
        let b2 = bbox(10., 1., 8., 30.);
        assert_eq!(iou(&b1, &b2), iou(&b2, &b1));
    }

    #[test]
    fn test_iou_degenerate() {
        let b = bbox(5., 5., 0., 0.);
        assert_eq!(iou(&b, &b), 0.0);
    }

    #[test]
    fn test_rescale() {
        let r = Rect::new(0.25, 0.5, 0.5, 0.25).rescale(Dimensions::new(400., 200.));
        assert_eq!(r, Rect::new(100., 100., 200., 50.));

        let b = BoundingBox::new(10., 10., 20., 30.)
            .rescale_between(Dimensions::new(100., 100.), Dimensions::new(200., 50.));
        assert_eq!(b, BoundingBox::new(20., 5., 40., 15.));

        let back = r.rescale_between(Dimensions::new(400., 200.), Dimensions::unit());
        assert_eq!(back, Rect::new(0.25, 0.5, 0.5, 0.25));
    }

    #[test]
    fn test_rect_bounding_box_conversion() {
        let r = Rect::new(1., 2., 3., 4.);
        let b = r.to_bounding_box();
        assert_eq!(b, BoundingBox::new(1., 2., 4., 6.));
        assert_eq!(Rect::from(b), r);
    }

    #[test]
    fn test_non_maximum_suppression() {
        let boxes = vec![
            bbox(0., 0., 10., 10.),
            bbox(1., 1., 10., 10.),
            bbox(50., 50., 10., 10.),
        ];
        let scores = vec![0.6, 0.9, 0.5];

        let picked = non_maximum_suppression(&boxes, &scores, 0.5, true);
        assert_eq!(picked, vec![1, 2]);

        let picked = non_maximum_suppression(&boxes, &scores, 0.5, false);
        assert_eq!(picked, vec![1, 2]);
    }

    #[test]
    fn test_non_maximum_suppression_ties() {
        let boxes = vec![bbox(0., 0., 1., 1.), bbox(0., 0., 1., 1.)];
        let scores = vec![0.5, 0.5];

        let picked = non_maximum_suppression(&boxes, &scores, 0.5, true);
        assert_eq!(picked, vec![0]);
    }

    #[test]
    fn test_non_maximum_suppression_unsorted() {
        let boxes = vec![bbox(0., 0., 1., 1.), bbox(5., 5., 1., 1.)];
        let scores = vec![0.2, 0.8];

        assert_eq!(non_maximum_suppression(&boxes, &scores, 0.5, true), vec![1, 0]);
        assert_eq!(non_maximum_suppression(&boxes, &scores, 0.5, false), vec![0, 1]);
        assert!(non_maximum_suppression(&[], &[], 0.5, true).is_empty());
    }
}
