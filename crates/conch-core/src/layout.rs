//! Named rectangular regions with z-order and batched redraw marking.
//!
//! Regions are absolute: no reflow, no constraint solving. Validation is
//! against the cached terminal dimensions supplied by the last
//! `calculate_layout` call.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::{CoreError, Result};

/// A named rectangular area of the terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    /// Unique region name.
    pub name: String,
    /// Left column, 0-based.
    pub x: u16,
    /// Top row, 0-based.
    pub y: u16,
    /// Width in cells, > 0.
    pub width: u16,
    /// Height in rows, > 0.
    pub height: u16,
    /// Stacking order; higher draws later (on top).
    pub z_order: i32,
    /// Hidden regions are skipped in the render order.
    pub visible: bool,
}

impl Region {
    /// Create a visible region at z-order 0.
    pub fn new(name: impl Into<String>, x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            width,
            height,
            z_order: 0,
            visible: true,
        }
    }

    /// Builder-style z-order override.
    #[must_use]
    pub fn with_z_order(mut self, z_order: i32) -> Self {
        self.z_order = z_order;
        self
    }

    /// Builder-style visibility override.
    #[must_use]
    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Whether the cell `(x, y)` lies inside this region.
    pub fn contains(&self, x: u16, y: u16) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

#[derive(Debug, Default)]
struct LayoutInner {
    regions: HashMap<String, Region>,
    term_width: u16,
    term_height: u16,
    dirty: BTreeSet<String>,
    batch_active: bool,
}

/// Owner of the named regions and the dirty/redraw bookkeeping.
///
/// All methods take `&self`; the manager is shared between the runtime and
/// its components behind an `Arc`.
#[derive(Debug)]
pub struct LayoutManager {
    inner: Mutex<LayoutInner>,
}

impl LayoutManager {
    /// Create a manager with cached terminal dimensions.
    pub fn new(term_width: u16, term_height: u16) -> Self {
        Self {
            inner: Mutex::new(LayoutInner {
                regions: HashMap::new(),
                term_width,
                term_height,
                dirty: BTreeSet::new(),
                batch_active: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LayoutInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn validate(region: &Region, term_width: u16, term_height: u16) -> Result<()> {
        if region.width == 0 || region.height == 0 {
            return Err(CoreError::Layout(format!(
                "region '{}' has non-positive size {}x{}",
                region.name, region.width, region.height
            )));
        }
        if u32::from(region.x) + u32::from(region.width) > u32::from(term_width)
            || u32::from(region.y) + u32::from(region.height) > u32::from(term_height)
        {
            return Err(CoreError::Layout(format!(
                "region '{}' ({},{} {}x{}) exceeds terminal {}x{}",
                region.name,
                region.x,
                region.y,
                region.width,
                region.height,
                term_width,
                term_height
            )));
        }
        Ok(())
    }

    /// Define a new region; fails on duplicates or invalid bounds.
    pub fn define_region(&self, region: Region) -> Result<()> {
        let mut inner = self.lock();
        Self::validate(&region, inner.term_width, inner.term_height)?;
        if inner.regions.contains_key(&region.name) {
            return Err(CoreError::Layout(format!(
                "region '{}' already defined",
                region.name
            )));
        }
        inner.dirty.insert(region.name.clone());
        inner.regions.insert(region.name.clone(), region);
        Ok(())
    }

    /// Replace an existing region's geometry; fails if unknown or invalid.
    pub fn update_region(&self, region: Region) -> Result<()> {
        let mut inner = self.lock();
        Self::validate(&region, inner.term_width, inner.term_height)?;
        if !inner.regions.contains_key(&region.name) {
            return Err(CoreError::Layout(format!(
                "region '{}' is not defined",
                region.name
            )));
        }
        inner.dirty.insert(region.name.clone());
        inner.regions.insert(region.name.clone(), region);
        Ok(())
    }

    /// Look up a region by name.
    pub fn get_region(&self, name: &str) -> Option<Region> {
        self.lock().regions.get(name).cloned()
    }

    /// Remove a region; fails if unknown.
    pub fn remove_region(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.regions.remove(name).is_none() {
            return Err(CoreError::Layout(format!("region '{name}' is not defined")));
        }
        inner.dirty.remove(name);
        Ok(())
    }

    /// All regions, sorted by name.
    pub fn list_regions(&self) -> Vec<Region> {
        let inner = self.lock();
        let mut regions: Vec<Region> = inner.regions.values().cloned().collect();
        regions.sort_by(|a, b| a.name.cmp(&b.name));
        regions
    }

    /// Cache new terminal dimensions and mark every region dirty.
    pub fn calculate_layout(&self, term_width: u16, term_height: u16) {
        let mut inner = self.lock();
        inner.term_width = term_width;
        inner.term_height = term_height;
        let names: Vec<String> = inner.regions.keys().cloned().collect();
        inner.dirty.extend(names);
    }

    /// The whole terminal as `(width, height)`.
    pub fn get_available_space(&self) -> (u16, u16) {
        let inner = self.lock();
        (inner.term_width, inner.term_height)
    }

    /// Open a redraw batch; dirty marks accumulate until `end_batch`.
    pub fn begin_batch(&self) {
        self.lock().batch_active = true;
    }

    /// Close the batch and drain the dirty set.
    ///
    /// Returns `false` if no batch was open.
    pub fn end_batch(&self) -> bool {
        let mut inner = self.lock();
        let was_active = inner.batch_active;
        inner.batch_active = false;
        inner.dirty.clear();
        was_active
    }

    /// Mark one region as needing redraw.
    pub fn request_redraw(&self, name: &str) {
        let mut inner = self.lock();
        if inner.regions.contains_key(name) {
            inner.dirty.insert(name.to_string());
        }
    }

    /// Mark every region as needing redraw.
    pub fn force_redraw(&self) {
        let mut inner = self.lock();
        let names: Vec<String> = inner.regions.keys().cloned().collect();
        inner.dirty.extend(names);
    }

    /// Names currently marked dirty, sorted.
    pub fn dirty_regions(&self) -> Vec<String> {
        self.lock().dirty.iter().cloned().collect()
    }

    /// Change a region's stacking order.
    pub fn set_z_order(&self, name: &str, z_order: i32) -> Result<()> {
        let mut inner = self.lock();
        match inner.regions.get_mut(name) {
            Some(region) => {
                region.z_order = z_order;
                inner.dirty.insert(name.to_string());
                Ok(())
            }
            None => Err(CoreError::Layout(format!("region '{name}' is not defined"))),
        }
    }

    /// Visible regions in paint order: ascending z, ties broken by name.
    pub fn get_render_order(&self) -> Vec<String> {
        let inner = self.lock();
        let mut visible: Vec<&Region> = inner.regions.values().filter(|r| r.visible).collect();
        visible.sort_by(|a, b| a.z_order.cmp(&b.z_order).then_with(|| a.name.cmp(&b.name)));
        visible.into_iter().map(|r| r.name.clone()).collect()
    }

    /// Regions covering the cell `(x, y)`, topmost first.
    pub fn regions_intersecting(&self, x: u16, y: u16) -> Vec<Region> {
        let inner = self.lock();
        let mut hits: Vec<Region> = inner
            .regions
            .values()
            .filter(|r| r.visible && r.contains(x, y))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.z_order.cmp(&a.z_order).then_with(|| a.name.cmp(&b.name)));
        hits
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn manager() -> LayoutManager {
        LayoutManager::new(80, 24)
    }

    #[test]
    fn define_and_get() {
        let lm = manager();
        lm.define_region(Region::new("footer", 0, 23, 80, 1)).unwrap();
        let region = lm.get_region("footer").unwrap();
        assert_eq!(region.y, 23);
        assert_eq!(region.height, 1);
    }

    #[test]
    fn duplicate_define_rejected() {
        let lm = manager();
        lm.define_region(Region::new("a", 0, 0, 10, 10)).unwrap();
        assert!(lm.define_region(Region::new("a", 0, 0, 5, 5)).is_err());
    }

    #[test]
    fn zero_size_rejected() {
        let lm = manager();
        assert!(lm.define_region(Region::new("a", 0, 0, 0, 5)).is_err());
        assert!(lm.define_region(Region::new("a", 0, 0, 5, 0)).is_err());
    }

    #[test]
    fn out_of_bounds_rejected() {
        let lm = manager();
        assert!(lm.define_region(Region::new("a", 70, 0, 20, 5)).is_err());
        assert!(lm.define_region(Region::new("a", 0, 20, 5, 10)).is_err());
    }

    #[test]
    fn update_unknown_rejected() {
        let lm = manager();
        assert!(lm.update_region(Region::new("ghost", 0, 0, 5, 5)).is_err());
    }

    #[test]
    fn update_changes_geometry() {
        let lm = manager();
        lm.define_region(Region::new("a", 0, 0, 10, 5)).unwrap();
        lm.update_region(Region::new("a", 5, 5, 20, 10)).unwrap();
        let region = lm.get_region("a").unwrap();
        assert_eq!((region.x, region.y), (5, 5));
    }

    #[test]
    fn remove_region_works() {
        let lm = manager();
        lm.define_region(Region::new("a", 0, 0, 10, 5)).unwrap();
        lm.remove_region("a").unwrap();
        assert!(lm.get_region("a").is_none());
        assert!(lm.remove_region("a").is_err());
    }

    #[test]
    fn list_sorted_by_name() {
        let lm = manager();
        lm.define_region(Region::new("zeta", 0, 0, 5, 5)).unwrap();
        lm.define_region(Region::new("alpha", 0, 0, 5, 5)).unwrap();
        let names: Vec<String> = lm.list_regions().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn render_order_by_z_then_name() {
        let lm = manager();
        lm.define_region(Region::new("b", 0, 0, 5, 5).with_z_order(1)).unwrap();
        lm.define_region(Region::new("a", 0, 0, 5, 5).with_z_order(1)).unwrap();
        lm.define_region(Region::new("top", 0, 0, 5, 5).with_z_order(9)).unwrap();
        lm.define_region(
            Region::new("hidden", 0, 0, 5, 5).with_z_order(99).with_visible(false),
        )
        .unwrap();
        assert_eq!(lm.get_render_order(), vec!["a", "b", "top"]);
    }

    #[test]
    fn batch_drains_dirty() {
        let lm = manager();
        lm.define_region(Region::new("a", 0, 0, 5, 5)).unwrap();
        lm.begin_batch();
        lm.request_redraw("a");
        assert!(!lm.dirty_regions().is_empty());
        assert!(lm.end_batch());
        assert!(lm.dirty_regions().is_empty());
        assert!(!lm.end_batch());
    }

    #[test]
    fn calculate_layout_marks_all_dirty() {
        let lm = manager();
        lm.define_region(Region::new("a", 0, 0, 5, 5)).unwrap();
        lm.define_region(Region::new("b", 0, 0, 5, 5)).unwrap();
        lm.begin_batch();
        lm.end_batch();
        lm.calculate_layout(100, 40);
        assert_eq!(lm.dirty_regions(), vec!["a", "b"]);
        assert_eq!(lm.get_available_space(), (100, 40));
    }

    #[test]
    fn resize_permits_larger_regions() {
        let lm = manager();
        assert!(lm.define_region(Region::new("wide", 0, 0, 100, 5)).is_err());
        lm.calculate_layout(120, 40);
        assert!(lm.define_region(Region::new("wide", 0, 0, 100, 5)).is_ok());
    }

    #[test]
    fn set_z_order_updates() {
        let lm = manager();
        lm.define_region(Region::new("a", 0, 0, 5, 5)).unwrap();
        lm.set_z_order("a", 7).unwrap();
        assert_eq!(lm.get_region("a").unwrap().z_order, 7);
        assert!(lm.set_z_order("ghost", 1).is_err());
    }

    #[test]
    fn intersection_topmost_first() {
        let lm = manager();
        lm.define_region(Region::new("base", 0, 0, 80, 24)).unwrap();
        lm.define_region(Region::new("modal", 10, 5, 30, 10).with_z_order(10)).unwrap();
        let hits = lm.regions_intersecting(15, 7);
        assert_eq!(hits[0].name, "modal");
        assert_eq!(hits[1].name, "base");
        assert!(lm.regions_intersecting(79, 23).len() == 1);
    }

    #[test]
    fn force_redraw_marks_all() {
        let lm = manager();
        lm.define_region(Region::new("a", 0, 0, 5, 5)).unwrap();
        lm.define_region(Region::new("b", 0, 0, 5, 5)).unwrap();
        lm.begin_batch();
        lm.end_batch();
        lm.force_redraw();
        assert_eq!(lm.dirty_regions().len(), 2);
    }
}
