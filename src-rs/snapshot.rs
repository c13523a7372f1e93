//! In-memory rendered document.
//!
//! A [`Document`] is a flattened snapshot of a laid-out page: tag, class,
//! resolved style and bounding rectangle for every element, plus the tree
//! links. It implements [`RenderTreeAccessor`] with the same hit-testing
//! rules a browser applies to pointer events, which makes it usable both as
//! a fixture format and as the accessor behind the CLI.
//!
//! Two input formats are accepted:
//!
//! * nested JSON, `{"root": {"tag": "html", "rect": {...}, "children": [...]}}`
//! * tab-separated rows in document order, one element per line:
//!   `depth, tag, class, x, y, w, h, z-index, background-image, src, pointer-events`

use crate::render_tree::{
    AccessError, ComputedStyle, ElementId, ElementInfo, Point, Rect, RenderTreeAccessor,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ROW_FIELDS: usize = 11;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid snapshot row {line}: {message}")]
    Row { line: usize, message: String },

    #[error("snapshot contains no elements")]
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ZIndex {
    Level(i64),
    Keyword(String),
}

impl ZIndex {
    fn level(&self) -> Option<i64> {
        match self {
            ZIndex::Level(v) => Some(*v),
            ZIndex::Keyword(raw) => raw.trim().parse::<i64>().ok(),
        }
    }

    fn raw(&self) -> String {
        match self {
            ZIndex::Level(v) => v.to_string(),
            ZIndex::Keyword(raw) => raw.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleSnapshot {
    pub background_image: Option<String>,
    pub z_index: Option<ZIndex>,
    pub pointer_events: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub tag: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub src: Option<String>,
    pub rect: Rect,
    #[serde(default)]
    pub style: StyleSnapshot,
    /// Makes style reads fail, as a cross-origin or detached element would.
    #[serde(default)]
    pub style_error: Option<String>,
    #[serde(default)]
    pub children: Vec<ElementSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub root: ElementSnapshot,
}

#[derive(Debug)]
struct Node {
    info: ElementInfo,
    style: ComputedStyle,
    style_error: Option<String>,
    rect: Rect,
    parent: Option<ElementId>,
    children: Vec<ElementId>,
    depth: usize,
    stack_level: i64,
    pointer_events: bool,
    hit_testable: Cell<bool>,
}

struct NodeInput<'a> {
    tag: &'a str,
    class: &'a str,
    src: Option<&'a str>,
    rect: Rect,
    background_image: Option<&'a str>,
    z_index: Option<ZIndex>,
    pointer_events: Option<&'a str>,
    style_error: Option<&'a str>,
}

/// Arena of elements in document order; `ElementId(0)` is the root.
///
/// Hit-test eligibility lives in a `Cell`, so a `Document` is not `Sync` and
/// occlusion probing against it cannot interleave across threads.
#[derive(Debug, Default)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Document {
    pub fn from_snapshot(snapshot: &DocumentSnapshot) -> Self {
        let mut doc = Document::default();
        doc.push_subtree(&snapshot.root, None);
        doc
    }

    pub fn from_json(raw: &str) -> Result<Self, SnapshotError> {
        let snapshot: DocumentSnapshot = serde_json::from_str(raw)?;
        Ok(Self::from_snapshot(&snapshot))
    }

    /// Parses the tab-separated row format. Depth 0 is the root; a row's
    /// parent is the nearest preceding row with a smaller depth.
    pub fn from_rows(raw: &str) -> Result<Self, SnapshotError> {
        let mut doc = Document::default();
        let mut stack: Vec<(usize, ElementId)> = Vec::new();

        for (index, line) in raw.lines().enumerate() {
            let line_no = index + 1;
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let mut parts: Vec<&str> = line.split('\t').map(str::trim).collect();
            while parts.len() < ROW_FIELDS {
                parts.push("");
            }

            let depth = parts[0].parse::<usize>().map_err(|_| SnapshotError::Row {
                line: line_no,
                message: format!("invalid depth {:?}", parts[0]),
            })?;
            let tag = parts[1];
            if tag.is_empty() {
                return Err(SnapshotError::Row {
                    line: line_no,
                    message: "missing tag".to_string(),
                });
            }
            let mut geometry = [0.0f64; 4];
            for (slot, raw_value) in geometry.iter_mut().zip(&parts[3..7]) {
                *slot = raw_value.parse::<f64>().map_err(|_| SnapshotError::Row {
                    line: line_no,
                    message: format!("invalid geometry value {raw_value:?}"),
                })?;
            }

            while stack.last().map(|(d, _)| *d >= depth).unwrap_or(false) {
                stack.pop();
            }
            let parent = stack.last().map(|(_, id)| *id);
            if parent.is_none() && !doc.nodes.is_empty() {
                return Err(SnapshotError::Row {
                    line: line_no,
                    message: "more than one root element".to_string(),
                });
            }

            let field = |i: usize| (!parts[i].is_empty()).then_some(parts[i]);

            let id = doc.push(
                NodeInput {
                    tag,
                    class: parts[2],
                    src: field(9),
                    rect: Rect::new(geometry[0], geometry[1], geometry[2], geometry[3]),
                    background_image: field(8),
                    z_index: field(7).map(|v| ZIndex::Keyword(v.to_string())),
                    pointer_events: field(10),
                    style_error: None,
                },
                parent,
            );
            stack.push((depth, id));
        }

        if doc.nodes.is_empty() {
            return Err(SnapshotError::Empty);
        }
        Ok(doc)
    }

    /// Loads a snapshot file; `.tsv` and `.rows` use the row format,
    /// anything else is read as JSON.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let raw = fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_rows = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "tsv" | "rows"))
            .unwrap_or(false);
        if is_rows {
            Self::from_rows(&raw)
        } else {
            Self::from_json(&raw)
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First element in document order carrying `class`.
    pub fn find_by_class(&self, class: &str) -> Option<ElementId> {
        self.nodes
            .iter()
            .position(|node| node.info.class.split_whitespace().any(|c| c == class))
            .map(ElementId)
    }

    /// Current hit-test eligibility of every element, in document order.
    pub fn hit_test_state(&self) -> Vec<bool> {
        self.nodes.iter().map(|node| node.hit_testable.get()).collect()
    }

    /// Tree depth of `id`; the root is 0.
    pub fn depth(&self, id: ElementId) -> Option<usize> {
        self.nodes.get(id.0).map(|node| node.depth)
    }

    fn push_subtree(&mut self, element: &ElementSnapshot, parent: Option<ElementId>) {
        let id = self.push(
            NodeInput {
                tag: &element.tag,
                class: &element.class,
                src: element.src.as_deref(),
                rect: element.rect,
                background_image: element.style.background_image.as_deref(),
                z_index: element.style.z_index.clone(),
                pointer_events: element.style.pointer_events.as_deref(),
                style_error: element.style_error.as_deref(),
            },
            parent,
        );
        for child in &element.children {
            self.push_subtree(child, Some(id));
        }
    }

    fn push(&mut self, input: NodeInput<'_>, parent: Option<ElementId>) -> ElementId {
        let id = ElementId(self.nodes.len());
        let parent_node = parent.and_then(|p| self.nodes.get(p.0));
        let depth = parent_node.map(|p| p.depth + 1).unwrap_or(0);
        let inherited_level = parent_node.map(|p| p.stack_level).unwrap_or(0);
        let inherited_pointer_events = parent_node.map(|p| p.pointer_events).unwrap_or(true);

        let stack_level = input
            .z_index
            .as_ref()
            .and_then(ZIndex::level)
            .unwrap_or(inherited_level);
        let pointer_events = match input.pointer_events {
            Some(v) if v.eq_ignore_ascii_case("none") => false,
            Some(_) => true,
            None => inherited_pointer_events,
        };

        self.nodes.push(Node {
            info: ElementInfo {
                tag: input.tag.to_string(),
                class: input.class.to_string(),
                src: input.src.map(ToString::to_string),
            },
            style: ComputedStyle {
                background_image: input
                    .background_image
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "none".to_string()),
                z_index: input
                    .z_index
                    .as_ref()
                    .map(ZIndex::raw)
                    .unwrap_or_else(|| "auto".to_string()),
            },
            style_error: input.style_error.map(ToString::to_string),
            rect: input.rect,
            parent,
            children: Vec::new(),
            depth,
            stack_level,
            pointer_events,
            hit_testable: Cell::new(true),
        });
        if let Some(parent) = parent {
            if let Some(node) = self.nodes.get_mut(parent.0) {
                node.children.push(id);
            }
        }
        id
    }

    fn node(&self, id: ElementId) -> Result<&Node, AccessError> {
        self.nodes.get(id.0).ok_or(AccessError::UnknownElement(id))
    }
}

impl RenderTreeAccessor for Document {
    fn elements_at(&self, point: Point) -> Result<Vec<ElementId>, AccessError> {
        let mut hits: Vec<(usize, i64)> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                node.pointer_events && node.hit_testable.get() && node.rect.contains_point(point)
            })
            .map(|(index, node)| (index, node.stack_level))
            .collect();
        // Later in document order paints on top within the same stack level.
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(hits.into_iter().map(|(index, _)| ElementId(index)).collect())
    }

    fn describe(&self, id: ElementId) -> Result<ElementInfo, AccessError> {
        Ok(self.node(id)?.info.clone())
    }

    fn computed_style(&self, id: ElementId) -> Result<ComputedStyle, AccessError> {
        let node = self.node(id)?;
        if let Some(reason) = &node.style_error {
            return Err(AccessError::StyleUnavailable {
                id,
                reason: reason.clone(),
            });
        }
        Ok(node.style.clone())
    }

    fn bounding_rect(&self, id: ElementId) -> Result<Rect, AccessError> {
        Ok(self.node(id)?.rect)
    }

    fn parent(&self, id: ElementId) -> Result<Option<ElementId>, AccessError> {
        Ok(self.node(id)?.parent)
    }

    fn children(&self, id: ElementId) -> Result<Vec<ElementId>, AccessError> {
        Ok(self.node(id)?.children.clone())
    }

    fn all_elements(&self) -> Result<Vec<ElementId>, AccessError> {
        Ok((0..self.nodes.len()).map(ElementId).collect())
    }

    fn is_document_boundary(&self, id: ElementId) -> Result<bool, AccessError> {
        let node = self.node(id)?;
        Ok(node.parent.is_none()
            || node.info.tag.eq_ignore_ascii_case("body")
            || node.info.tag.eq_ignore_ascii_case("html"))
    }

    fn supports_hit_test_mutation(&self) -> bool {
        true
    }

    fn set_hit_testable(&self, id: ElementId, enabled: bool) -> Result<bool, AccessError> {
        Ok(self.node(id)?.hit_testable.replace(enabled))
    }
}
