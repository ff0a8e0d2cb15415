//! Which top-level columns are loaded around the camera.

use glam::IVec3;
use rustc_hash::FxHashSet;

/// Columns to load and unload this frame, in `top_lod` section units.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ColumnChanges {
    /// Nearest first.
    pub add: Vec<(i32, i32)>,
    pub remove: Vec<(i32, i32)>,
}

impl ColumnChanges {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Keeps a circle of top-level columns loaded around the camera.
///
/// The render distance is given in LOD-0 sections and rounded up to whole
/// columns. At most `budget` columns change per frame; unfinished work
/// continues on the following frames.
pub struct RenderDistanceTracker {
    top_lod: u8,
    radius: i32,
    budget: usize,
    center: Option<(i32, i32)>,
    settled: bool,
}

impl RenderDistanceTracker {
    pub fn new(render_distance: u32, top_lod: u8, budget: u32) -> Self {
        Self {
            top_lod,
            radius: Self::columns_for(render_distance, top_lod),
            budget: budget.max(1) as usize,
            center: None,
            settled: false,
        }
    }

    fn columns_for(render_distance: u32, top_lod: u8) -> i32 {
        let column_sections = 1u32 << top_lod;
        render_distance.div_ceil(column_sections).max(1) as i32
    }

    /// Load radius in columns.
    pub fn radius(&self) -> i32 {
        self.radius
    }

    /// Change the render distance. Returns `true` if the radius shrank.
    pub fn set_render_distance(&mut self, render_distance: u32) -> bool {
        let radius = Self::columns_for(render_distance, self.top_lod);
        let shrunk = radius < self.radius;
        if radius != self.radius {
            self.radius = radius;
            self.settled = false;
        }
        shrunk
    }

    pub fn column_of(&self, camera_section: IVec3) -> (i32, i32) {
        (camera_section.x >> self.top_lod, camera_section.z >> self.top_lod)
    }

    pub fn in_range(&self, center: (i32, i32), column: (i32, i32)) -> bool {
        let dx = i64::from(column.0 - center.0);
        let dz = i64::from(column.1 - center.1);
        let r = i64::from(self.radius);
        dx * dx + dz * dz <= r * r
    }

    /// Whether [`Self::update`] has work for this camera position.
    pub fn needs_update(&self, camera_section: IVec3) -> bool {
        !self.settled || self.center != Some(self.column_of(camera_section))
    }

    /// Diff the wanted circle against `loaded`. Removals come first and
    /// share the per-frame budget with additions.
    pub fn update(&mut self, camera_section: IVec3, loaded: &FxHashSet<(i32, i32)>) -> ColumnChanges {
        let center = self.column_of(camera_section);
        self.center = Some(center);

        let mut remove: Vec<(i32, i32)> = loaded
            .iter()
            .copied()
            .filter(|&column| !self.in_range(center, column))
            .collect();
        remove.sort_unstable();

        let r = self.radius;
        let mut add = Vec::new();
        for dz in -r..=r {
            for dx in -r..=r {
                let column = (center.0 + dx, center.1 + dz);
                if self.in_range(center, column) && !loaded.contains(&column) {
                    add.push(column);
                }
            }
        }
        add.sort_by_key(|&(x, z)| {
            let (dx, dz) = (i64::from(x - center.0), i64::from(z - center.1));
            (dx * dx + dz * dz, x, z)
        });

        let total = remove.len() + add.len();
        remove.truncate(self.budget);
        add.truncate(self.budget - remove.len());
        self.settled = remove.len() + add.len() == total;
        ColumnChanges { add, remove }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(loaded: &mut FxHashSet<(i32, i32)>, changes: &ColumnChanges) {
        for column in &changes.remove {
            loaded.remove(column);
        }
        loaded.extend(changes.add.iter().copied());
    }

    #[test]
    fn test_radius_rounds_up_to_columns() {
        assert_eq!(RenderDistanceTracker::new(16, 4, 8).radius(), 1);
        assert_eq!(RenderDistanceTracker::new(17, 4, 8).radius(), 2);
        assert_eq!(RenderDistanceTracker::new(4, 0, 8).radius(), 4);
    }

    #[test]
    fn test_initial_fill_is_circular_and_nearest_first() {
        let mut tracker = RenderDistanceTracker::new(2, 0, 1000);
        let changes = tracker.update(IVec3::ZERO, &FxHashSet::default());
        // r = 2: 13 lattice points satisfy dx² + dz² <= 4.
        assert_eq!(changes.add.len(), 13);
        assert_eq!(changes.add[0], (0, 0));
        assert!(!changes.add.contains(&(2, 2)));
        assert!(changes.remove.is_empty());
        assert!(!tracker.needs_update(IVec3::ZERO));
    }

    #[test]
    fn test_budget_spreads_work() {
        let mut tracker = RenderDistanceTracker::new(2, 0, 5);
        let mut loaded = FxHashSet::default();
        let mut frames = 0;
        while tracker.needs_update(IVec3::ZERO) {
            let changes = tracker.update(IVec3::ZERO, &loaded);
            assert!(changes.add.len() <= 5);
            apply(&mut loaded, &changes);
            frames += 1;
        }
        assert_eq!(frames, 3);
        assert_eq!(loaded.len(), 13);
    }

    #[test]
    fn test_moving_camera_swaps_columns() {
        let mut tracker = RenderDistanceTracker::new(16, 4, 100);
        let mut loaded = FxHashSet::default();
        let initial = tracker.update(IVec3::new(0, 0, 0), &loaded);
        apply(&mut loaded, &initial);
        assert_eq!(loaded.len(), 5);

        // Section 16 is column 1 at top_lod 4.
        let moved = IVec3::new(16, 3, 0);
        assert!(tracker.needs_update(moved));
        let changes = tracker.update(moved, &loaded);
        assert_eq!(changes.remove.len(), 3);
        assert_eq!(changes.add.len(), 3);
        assert!(changes.add.contains(&(2, 0)));
        assert!(changes.remove.contains(&(-1, 0)));
    }

    #[test]
    fn test_negative_sections_floor_to_columns() {
        let tracker = RenderDistanceTracker::new(16, 4, 1);
        assert_eq!(tracker.column_of(IVec3::new(-1, 0, -17)), (-1, -2));
    }

    #[test]
    fn test_shrinking_reports_and_unloads() {
        let mut tracker = RenderDistanceTracker::new(2, 0, 100);
        let mut loaded = FxHashSet::default();
        let initial = tracker.update(IVec3::ZERO, &loaded);
        apply(&mut loaded, &initial);
        assert!(tracker.set_render_distance(1));
        assert!(!tracker.set_render_distance(1));
        assert!(tracker.needs_update(IVec3::ZERO));
        let changes = tracker.update(IVec3::ZERO, &loaded);
        assert_eq!(changes.remove.len(), 8);
        assert!(changes.add.is_empty());
    }
}
