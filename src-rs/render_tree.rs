//! Render tree access.
//!
//! The locator never talks to a concrete renderer. Everything it needs from a
//! rendered page (hit-testing, resolved style, geometry and tree structure) is
//! asked through [`RenderTreeAccessor`], so a browser bridge, a headless
//! engine and the in-memory [`Document`](crate::snapshot::Document) can all
//! sit behind the same search.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A point in document pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding rectangle in the same space as [`Point`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    #[serde(alias = "w")]
    pub width: f64,
    #[serde(alias = "h")]
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Square of half-side `radius` centred on `center`.
    pub fn around(center: Point, radius: f64) -> Self {
        Self::new(
            center.x - radius,
            center.y - radius,
            radius * 2.0,
            radius * 2.0,
        )
    }

    pub fn max_x(&self) -> f64 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f64 {
        self.y + self.height
    }

    /// Half-open: the left and top edges belong to the rect, the right and
    /// bottom edges belong to whatever sits next to it.
    pub fn contains_point(&self, point: Point) -> bool {
        point.x >= self.x && point.x < self.max_x() && point.y >= self.y && point.y < self.max_y()
    }

    /// Edges are inclusive.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x <= other.max_x()
            && self.max_x() >= other.x
            && self.y <= other.max_y()
            && self.max_y() >= other.y
    }
}

/// Opaque handle to an element owned by an accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub usize);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static facts about an element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementInfo {
    pub tag: String,
    pub class: String,
    pub src: Option<String>,
}

impl ElementInfo {
    pub fn is_image(&self) -> bool {
        self.tag.eq_ignore_ascii_case("img")
    }
}

/// Resolved style values, reported as raw strings the way a renderer's
/// computed-style interface does.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputedStyle {
    pub background_image: String,
    pub z_index: String,
}

impl ComputedStyle {
    /// Numeric stacking value; `auto` and anything unparsable count as 0.
    pub fn stack_level(&self) -> i64 {
        self.z_index.trim().parse::<i64>().unwrap_or(0)
    }
}

impl Default for ComputedStyle {
    fn default() -> Self {
        Self {
            background_image: "none".to_string(),
            z_index: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccessError {
    #[error("unknown element {0}")]
    UnknownElement(ElementId),

    #[error("style of element {id} is unavailable: {reason}")]
    StyleUnavailable { id: ElementId, reason: String },

    #[error("hit-test eligibility cannot be changed in this document")]
    MutationUnsupported,
}

/// Capability interface over one rendered document.
///
/// Methods take `&self`: implementations that support
/// [`set_hit_testable`](Self::set_hit_testable) mutate through interior
/// mutability, the same way a live DOM handle would.
pub trait RenderTreeAccessor {
    /// Elements covering `point`, topmost first.
    fn elements_at(&self, point: Point) -> Result<Vec<ElementId>, AccessError>;

    fn top_element_at(&self, point: Point) -> Result<Option<ElementId>, AccessError> {
        Ok(self.elements_at(point)?.into_iter().next())
    }

    fn describe(&self, id: ElementId) -> Result<ElementInfo, AccessError>;

    fn computed_style(&self, id: ElementId) -> Result<ComputedStyle, AccessError>;

    fn bounding_rect(&self, id: ElementId) -> Result<Rect, AccessError>;

    fn parent(&self, id: ElementId) -> Result<Option<ElementId>, AccessError>;

    fn children(&self, id: ElementId) -> Result<Vec<ElementId>, AccessError>;

    /// All descendants in pre-order.
    fn descendants(&self, id: ElementId) -> Result<Vec<ElementId>, AccessError> {
        let mut out = Vec::new();
        let mut stack: Vec<ElementId> = self.children(id)?.into_iter().rev().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next)?.into_iter().rev());
        }
        Ok(out)
    }

    /// Every element of the document in document order.
    fn all_elements(&self) -> Result<Vec<ElementId>, AccessError>;

    /// True for the document root and the top-level body container.
    fn is_document_boundary(&self, id: ElementId) -> Result<bool, AccessError>;

    fn supports_hit_test_mutation(&self) -> bool {
        false
    }

    /// Sets whether `id` takes part in hit-testing, returning the previous
    /// setting.
    fn set_hit_testable(&self, _id: ElementId, _enabled: bool) -> Result<bool, AccessError> {
        Err(AccessError::MutationUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_contains_edges() {
        let rect = Rect::new(10.0, 10.0, 100.0, 50.0);
        assert!(rect.contains_point(Point::new(10.0, 10.0)));
        assert!(rect.contains_point(Point::new(109.5, 59.5)));
        assert!(!rect.contains_point(Point::new(110.0, 30.0)));
        assert!(!rect.contains_point(Point::new(50.0, 60.0)));
        assert!(!rect.contains_point(Point::new(-1.0, 20.0)));
    }

    #[test]
    fn adjacent_tiles_do_not_share_an_edge() {
        let left = Rect::new(0.0, 0.0, 100.0, 100.0);
        let right = Rect::new(100.0, 0.0, 100.0, 100.0);
        let seam = Point::new(100.0, 50.0);
        assert!(!left.contains_point(seam));
        assert!(right.contains_point(seam));
        assert!(left.intersects(&right));
    }

    #[test]
    fn neighbourhood_square_intersects_nearby_rects() {
        let square = Rect::around(Point::new(50.0, 50.0), 10.0);
        assert!(Rect::new(58.0, 58.0, 5.0, 5.0).intersects(&square));
        assert!(Rect::new(60.0, 40.0, 5.0, 5.0).intersects(&square));
        assert!(!Rect::new(61.0, 40.0, 5.0, 5.0).intersects(&square));
    }

    #[test]
    fn stack_level_treats_auto_as_zero() {
        let mut style = ComputedStyle::default();
        assert_eq!(style.stack_level(), 0);
        style.z_index = "-3".to_string();
        assert_eq!(style.stack_level(), -3);
        style.z_index = "12".to_string();
        assert_eq!(style.stack_level(), 12);
    }
}
