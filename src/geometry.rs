//! Page-relative rectangles.
//!
//! Every bounding box in this crate uses a **top-left origin** with `y`
//! growing downwards, measured in PDF points (1/72 inch). The page splitter
//! converts from PDF user space (bottom-left origin) exactly once, so the
//! classifier and fusion engine never have to think about it.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle on a page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    /// Build a box from two corners in any order.
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            left: x0.min(x1),
            top: y0.min(y1),
            right: x0.max(x1),
            bottom: y0.max(y1),
        }
    }

    /// Build a box from its top-left corner and size.
    pub fn from_origin_size(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self::new(left, top, left + width, top + height)
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn centre(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    pub fn intersection_area(&self, other: &Self) -> f32 {
        let x_overlap = (self.right.min(other.right) - self.left.max(other.left)).max(0.0);
        let y_overlap = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.0);
        x_overlap * y_overlap
    }

    /// Intersection-over-union in `[0, 1]`. Degenerate boxes give `0.0`.
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        (intersection / union).clamp(0.0, 1.0)
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    /// Width of the shared horizontal span (0 when disjoint).
    pub fn horizontal_overlap(&self, other: &Self) -> f32 {
        (self.right.min(other.right) - self.left.max(other.left)).max(0.0)
    }

    /// Height of the shared vertical span (0 when disjoint).
    pub fn vertical_overlap(&self, other: &Self) -> f32 {
        (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.0)
    }

    /// Union of a non-empty sequence of boxes.
    pub fn enclosing<'a>(boxes: impl IntoIterator<Item = &'a BoundingBox>) -> Option<Self> {
        boxes.into_iter().fold(None, |acc, b| match acc {
            None => Some(*b),
            Some(a) => Some(a.union(b)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_size_containment_and_overlaps() {
        let a = BoundingBox::from_origin_size(10.0, 10.0, 20.0, 10.0);
        assert_eq!(a, BoundingBox::new(10.0, 10.0, 30.0, 20.0));
        assert!(a.contains_point(30.0, 15.0));
        assert!(!a.contains_point(31.0, 15.0));

        let b = BoundingBox::new(25.0, 15.0, 40.0, 40.0);
        assert_eq!(a.horizontal_overlap(&b), 5.0);
        assert_eq!(a.vertical_overlap(&b), 5.0);
        let far = BoundingBox::new(100.0, 100.0, 110.0, 110.0);
        assert_eq!(a.vertical_overlap(&far), 0.0);
    }

    #[test]
    fn new_normalises_corner_order() {
        let b = BoundingBox::new(10.0, 20.0, 0.0, 5.0);
        assert_eq!(b.left, 0.0);
        assert_eq!(b.top, 5.0);
        assert_eq!(b.right, 10.0);
        assert_eq!(b.bottom, 20.0);
    }

    #[test]
    fn iou_identical_is_one() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_half_shifted() {
        // Overlap 5x10 = 50, union 150.
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn iou_degenerate_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn enclosing_covers_all() {
        let boxes = [
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            BoundingBox::new(5.0, -2.0, 6.0, 3.0),
        ];
        let u = BoundingBox::enclosing(boxes.iter()).unwrap();
        assert_eq!(u, BoundingBox::new(0.0, -2.0, 6.0, 3.0));
        assert!(BoundingBox::enclosing(std::iter::empty()).is_none());
    }
}
