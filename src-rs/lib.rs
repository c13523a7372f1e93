//! Find the image painted under a point of a rendered document.
//!
//! ```
//! use image_locator::{locate, Document, Query};
//!
//! let doc = Document::from_rows(
//!     "0\thtml\t\t0\t0\t800\t600\n\
//!      1\tbody\t\t0\t0\t800\t600\n\
//!      2\tdiv\thero\t0\t0\t400\t300\t\turl('https://x/img.png')\n\
//!      2\tdiv\ttint\t0\t0\t400\t300\t5\n",
//! )
//! .unwrap();
//!
//! let result = locate(&doc, Query::new(100.0, 100.0));
//! assert_eq!(result.url(), Some("https://x/img.png"));
//! ```

pub mod config;
pub mod css_url;
pub mod locator;
pub mod render_tree;
pub mod snapshot;

pub use config::{ConfigError, LocatorConfig, LookBehind};
pub use css_url::extract_css_url;
pub use locator::{
    locate, resolve_element_image, Diagnostics, FailureKind, InspectedElement, LocateError,
    Locator, Query, ResolutionResult, Strategy,
};
pub use render_tree::{
    AccessError, ComputedStyle, ElementId, ElementInfo, Point, Rect, RenderTreeAccessor,
};
pub use snapshot::{Document, DocumentSnapshot, ElementSnapshot, SnapshotError};
