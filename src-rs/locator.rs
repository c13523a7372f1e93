//! Point-to-image resolution.
//!
//! [`Locator::locate`] answers "which image is under this pixel?" by running
//! a fixed sequence of searches over the render tree and stopping at the
//! first hit:
//!
//! 1. direct check of the hit-test stack, topmost first
//! 2. a look behind the top layers, either by occlusion probing or by a
//!    read-only bounds check (see [`LookBehind`])
//! 3. ancestors of the deepest hit element, up to the body
//! 4. descendants of every non-boundary hit element
//! 5. every element within a small square around the point
//!
//! Failures never escape as `Err`: the caller always gets a
//! [`ResolutionResult`] and branches on `success`.

use crate::config::{LocatorConfig, LookBehind};
use crate::css_url::extract_css_url;
use crate::render_tree::{AccessError, ElementId, Point, Rect, RenderTreeAccessor};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Click position in document pixel space.
pub type Query = Point;

const UNAVAILABLE: &str = "<unavailable>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    HitTest,
    DirectCheck,
    OcclusionProbe,
    BoundsCheck,
    AncestorTraversal,
    DescendantScan,
    NeighborhoodScan,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::HitTest => "hit-test",
            Strategy::DirectCheck => "direct-check",
            Strategy::OcclusionProbe => "occlusion-probe",
            Strategy::BoundsCheck => "bounds-check",
            Strategy::AncestorTraversal => "ancestor-traversal",
            Strategy::DescendantScan => "descendant-scan",
            Strategy::NeighborhoodScan => "neighborhood-scan",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    EmptyHitTest,
    NotFound,
    ResolutionFault,
}

/// Why a search produced no URL. `Display` is the user-facing reason.
#[derive(Debug, Error)]
pub enum LocateError {
    #[error("no elements found at coordinates")]
    EmptyHitTest,

    #[error("no image found at coordinates")]
    NotFound,

    #[error("Error: {0}")]
    Fault(#[from] AccessError),
}

impl LocateError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LocateError::EmptyHitTest => FailureKind::EmptyHitTest,
            LocateError::NotFound => FailureKind::NotFound,
            LocateError::Fault(_) => FailureKind::ResolutionFault,
        }
    }
}

/// One hit-stack element as seen by the direct check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectedElement {
    pub tag: String,
    pub class: String,
    pub background_image: String,
    pub z_index: String,
}

/// Debugging record attached to every result. Never drives control flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub x: f64,
    pub y: f64,
    pub elements_found: usize,
    pub strategy: Strategy,
    pub checked: Vec<InspectedElement>,
}

impl Diagnostics {
    fn new(query: Query) -> Self {
        Self {
            x: query.x,
            y: query.y,
            elements_found: 0,
            strategy: Strategy::HitTest,
            checked: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub diagnostics: Diagnostics,
}

impl ResolutionResult {
    fn found(url: String, diagnostics: Diagnostics) -> Self {
        Self {
            success: true,
            url: Some(url),
            reason: None,
            failure: None,
            diagnostics,
        }
    }

    fn failed(err: &LocateError, diagnostics: Diagnostics) -> Self {
        Self {
            success: false,
            url: None,
            reason: Some(err.to_string()),
            failure: Some(err.kind()),
            diagnostics,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

/// Image URL carried by a single element, if any.
///
/// An `img` with a non-empty `src` wins over its background. Accessor
/// failures count as "no image" for this element.
pub fn resolve_element_image<A>(accessor: &A, id: ElementId) -> Option<String>
where
    A: RenderTreeAccessor + ?Sized,
{
    match try_resolve_element_image(accessor, id) {
        Ok(url) => url,
        Err(err) => {
            warn!(element = %id, error = %err, "skipping element whose style cannot be read");
            None
        }
    }
}

fn try_resolve_element_image<A>(accessor: &A, id: ElementId) -> Result<Option<String>, AccessError>
where
    A: RenderTreeAccessor + ?Sized,
{
    let info = accessor.describe(id)?;
    if info.is_image() {
        if let Some(src) = info.src.as_deref().filter(|s| !s.trim().is_empty()) {
            return Ok(Some(src.to_string()));
        }
    }
    let style = accessor.computed_style(id)?;
    Ok(extract_css_url(&style.background_image))
}

fn inspect<A>(accessor: &A, id: ElementId) -> InspectedElement
where
    A: RenderTreeAccessor + ?Sized,
{
    let (tag, class) = match accessor.describe(id) {
        Ok(info) => (info.tag, info.class),
        Err(_) => (UNAVAILABLE.to_string(), UNAVAILABLE.to_string()),
    };
    let (background_image, z_index) = match accessor.computed_style(id) {
        Ok(style) => (style.background_image, style.z_index),
        Err(_) => (UNAVAILABLE.to_string(), UNAVAILABLE.to_string()),
    };
    InspectedElement {
        tag,
        class,
        background_image,
        z_index,
    }
}

/// Keeps one element out of hit-testing until dropped.
struct HitTestSuppression<'a, A: RenderTreeAccessor + ?Sized> {
    accessor: &'a A,
    id: ElementId,
    previous: bool,
}

impl<'a, A: RenderTreeAccessor + ?Sized> HitTestSuppression<'a, A> {
    fn new(accessor: &'a A, id: ElementId) -> Result<Self, AccessError> {
        let previous = accessor.set_hit_testable(id, false)?;
        Ok(Self {
            accessor,
            id,
            previous,
        })
    }
}

impl<A: RenderTreeAccessor + ?Sized> Drop for HitTestSuppression<'_, A> {
    fn drop(&mut self) {
        if let Err(err) = self.accessor.set_hit_testable(self.id, self.previous) {
            warn!(element = %self.id, error = %err, "failed to restore hit-testing");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Locator {
    config: LocatorConfig,
}

impl Locator {
    pub fn new(config: LocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// Strategies in the order they will run against `accessor`.
    pub fn plan<A>(&self, accessor: &A) -> Vec<Strategy>
    where
        A: RenderTreeAccessor + ?Sized,
    {
        let mut plan = vec![Strategy::DirectCheck];
        plan.push(match self.config.look_behind {
            LookBehind::OcclusionProbe if accessor.supports_hit_test_mutation() => {
                Strategy::OcclusionProbe
            }
            LookBehind::OcclusionProbe => {
                debug!("accessor cannot toggle hit-testing, using bounds check");
                Strategy::BoundsCheck
            }
            LookBehind::BoundsCheck => Strategy::BoundsCheck,
        });
        if self.config.ancestor_traversal {
            plan.push(Strategy::AncestorTraversal);
        }
        if self.config.descendant_scan {
            plan.push(Strategy::DescendantScan);
        }
        if self.config.neighborhood_scan {
            plan.push(Strategy::NeighborhoodScan);
        }
        plan
    }

    pub fn locate<A>(&self, accessor: &A, query: Query) -> ResolutionResult
    where
        A: RenderTreeAccessor + ?Sized,
    {
        let mut diagnostics = Diagnostics::new(query);
        match self.search(accessor, query, &mut diagnostics) {
            Ok(url) => {
                debug!(strategy = %diagnostics.strategy, url = %url, "image located");
                ResolutionResult::found(url, diagnostics)
            }
            Err(err) => {
                debug!(strategy = %diagnostics.strategy, reason = %err, "no image located");
                ResolutionResult::failed(&err, diagnostics)
            }
        }
    }

    fn search<A>(
        &self,
        accessor: &A,
        query: Query,
        diagnostics: &mut Diagnostics,
    ) -> Result<String, LocateError>
    where
        A: RenderTreeAccessor + ?Sized,
    {
        let candidates = accessor.elements_at(query)?;
        diagnostics.elements_found = candidates.len();
        if candidates.is_empty() {
            return Err(LocateError::EmptyHitTest);
        }

        for strategy in self.plan(accessor) {
            diagnostics.strategy = strategy;
            debug!(strategy = %strategy, x = query.x, y = query.y, "trying strategy");
            let hit = match strategy {
                Strategy::HitTest => None,
                Strategy::DirectCheck => direct_check(accessor, &candidates, &mut diagnostics.checked),
                Strategy::OcclusionProbe => occlusion_probe(accessor, query, &candidates)?,
                Strategy::BoundsCheck => bounds_check(accessor, query, &candidates),
                Strategy::AncestorTraversal => ancestor_traversal(accessor, &candidates)?,
                Strategy::DescendantScan => descendant_scan(accessor, &candidates)?,
                Strategy::NeighborhoodScan => {
                    neighborhood_scan(accessor, query, self.config.neighborhood_radius)?
                }
            };
            if let Some(url) = hit {
                return Ok(url);
            }
        }

        Err(LocateError::NotFound)
    }
}

/// Runs [`Locator::locate`] with the default configuration.
pub fn locate<A>(accessor: &A, query: Query) -> ResolutionResult
where
    A: RenderTreeAccessor + ?Sized,
{
    Locator::default().locate(accessor, query)
}

fn direct_check<A>(
    accessor: &A,
    candidates: &[ElementId],
    checked: &mut Vec<InspectedElement>,
) -> Option<String>
where
    A: RenderTreeAccessor + ?Sized,
{
    for &id in candidates {
        let inspected = inspect(accessor, id);
        trace!(element = %id, tag = %inspected.tag, background = %inspected.background_image, "direct check");
        checked.push(inspected);
        if let Some(url) = resolve_element_image(accessor, id) {
            return Some(url);
        }
    }
    None
}

/// Peels hit-stack layers off one by one, keeping every peeled layer out of
/// hit-testing until the probe ends, and tests whatever surfaces on top.
fn occlusion_probe<A>(
    accessor: &A,
    query: Query,
    candidates: &[ElementId],
) -> Result<Option<String>, AccessError>
where
    A: RenderTreeAccessor + ?Sized,
{
    let Some((_, layers)) = candidates.split_last() else {
        return Ok(None);
    };

    let mut peeled: Vec<HitTestSuppression<'_, A>> = Vec::with_capacity(layers.len());
    for &id in layers {
        peeled.push(HitTestSuppression::new(accessor, id)?);
        let Some(revealed) = accessor.top_element_at(query)? else {
            break;
        };
        trace!(peeled = %id, revealed = %revealed, "occlusion probe");
        if let Some(url) = resolve_element_image(accessor, revealed) {
            return Ok(Some(url));
        }
    }
    Ok(None)
}

/// Read-only look behind: candidates ordered by ascending stacking value so
/// the background-most layer is tried first. Elements whose geometry or
/// style cannot be read are left out.
fn bounds_check<A>(accessor: &A, query: Query, candidates: &[ElementId]) -> Option<String>
where
    A: RenderTreeAccessor + ?Sized,
{
    let mut layered: Vec<(i64, ElementId, Rect)> = Vec::with_capacity(candidates.len());
    for &id in candidates {
        let layer = accessor.bounding_rect(id).and_then(|rect| {
            let level = accessor.computed_style(id)?.stack_level();
            Ok((level, id, rect))
        });
        match layer {
            Ok(layer) => layered.push(layer),
            Err(err) => {
                warn!(element = %id, error = %err, "skipping element whose layout cannot be read");
            }
        }
    }
    layered.sort_by_key(|(level, _, _)| *level);

    for (_, id, rect) in layered {
        if rect.contains_point(query) {
            if let Some(url) = resolve_element_image(accessor, id) {
                return Some(url);
            }
        }
    }
    None
}

fn tree_depth<A>(accessor: &A, id: ElementId) -> Result<usize, AccessError>
where
    A: RenderTreeAccessor + ?Sized,
{
    let mut depth = 0;
    let mut current = accessor.parent(id)?;
    while let Some(parent) = current {
        depth += 1;
        current = accessor.parent(parent)?;
    }
    Ok(depth)
}

/// Walks up from the deepest hit element, stopping before the body/root.
fn ancestor_traversal<A>(
    accessor: &A,
    candidates: &[ElementId],
) -> Result<Option<String>, AccessError>
where
    A: RenderTreeAccessor + ?Sized,
{
    let mut start: Option<(ElementId, usize)> = None;
    for &id in candidates {
        let depth = tree_depth(accessor, id)?;
        if start.map(|(_, best)| depth > best).unwrap_or(true) {
            start = Some((id, depth));
        }
    }
    let Some((start, _)) = start else {
        return Ok(None);
    };

    let mut current = accessor.parent(start)?;
    while let Some(id) = current {
        if accessor.is_document_boundary(id)? {
            break;
        }
        if let Some(url) = resolve_element_image(accessor, id) {
            return Ok(Some(url));
        }
        current = accessor.parent(id)?;
    }
    Ok(None)
}

/// Searches inside each hit element. The body and root are skipped: their
/// subtree is the whole page, which the neighbourhood scan covers with a
/// spatial bound.
fn descendant_scan<A>(accessor: &A, candidates: &[ElementId]) -> Result<Option<String>, AccessError>
where
    A: RenderTreeAccessor + ?Sized,
{
    for &id in candidates {
        if accessor.is_document_boundary(id)? {
            continue;
        }
        for descendant in accessor.descendants(id)? {
            if let Some(url) = resolve_element_image(accessor, descendant) {
                return Ok(Some(url));
            }
        }
    }
    Ok(None)
}

fn neighborhood_scan<A>(
    accessor: &A,
    query: Query,
    radius: f64,
) -> Result<Option<String>, AccessError>
where
    A: RenderTreeAccessor + ?Sized,
{
    let probe = Rect::around(query, radius);
    for id in accessor.all_elements()? {
        if !accessor.bounding_rect(id)?.intersects(&probe) {
            continue;
        }
        if let Some(url) = resolve_element_image(accessor, id) {
            return Ok(Some(url));
        }
    }
    Ok(None)
}
