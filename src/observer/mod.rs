use crate::geometry::Int2;
use crate::hierarchy::{Hierarchy, HierarchyDiagnostics};

#[cfg(feature = "serde")]
use serde::Serialize;

/// A read-only snapshot of what the hierarchy is doing.
///
/// Design intent:
/// - Observers cannot mutate or steer the hierarchy.
/// - Snapshotting is *on-demand* and can allocate; the step loop stays unchanged.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct HierarchySnapshot {
    pub steps: u64,
    pub diagnostics: HierarchyDiagnostics,
    pub layers: Vec<LayerSnapshot>,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LayerSnapshot {
    pub index: usize,
    pub size: Int2,
    /// Positions of the active code units.
    pub active_cells: Vec<Int2>,
    pub max_reward: f32,
    pub min_reward: f32,
}

pub struct HierarchyAdapter<'a> {
    hierarchy: &'a Hierarchy,
}

impl<'a> HierarchyAdapter<'a> {
    pub fn new(hierarchy: &'a Hierarchy) -> Self {
        Self { hierarchy }
    }

    pub fn snapshot(&self) -> HierarchySnapshot {
        let layers = (0..self.hierarchy.num_layers())
            .map(|l| self.layer_snapshot(l))
            .collect();

        HierarchySnapshot {
            steps: self.hierarchy.steps(),
            diagnostics: self.hierarchy.diagnostics(),
            layers,
        }
    }

    fn layer_snapshot(&self, l: usize) -> LayerSnapshot {
        let code = self.hierarchy.layer_code(l);
        let size = code.size();
        let active_cells = code
            .data()
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > 0.0)
            .map(|(i, _)| size.position_of(i))
            .collect();

        let rewards = self.hierarchy.layer_rewards(l).data();
        let max_reward = rewards.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min_reward = rewards.iter().copied().fold(f32::INFINITY, f32::min);

        LayerSnapshot {
            index: l,
            size,
            active_cells,
            max_reward,
            min_reward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::hierarchy::{HierarchyConfig, LayerDesc};
    use crate::prng::Prng;

    #[test]
    fn snapshot_lists_active_cells() {
        let config = HierarchyConfig::new(
            Int2::new(4, 4),
            vec![LayerDesc::new(Int2::new(6, 6)), LayerDesc::new(Int2::new(4, 4))],
        );
        let mut h = Hierarchy::new(config, &mut Prng::new(5)).unwrap();
        let input = Grid::filled(Int2::new(4, 4), 1, 1.0);
        h.step(&input, 0.0, true).unwrap();

        let snap = HierarchyAdapter::new(&h).snapshot();
        assert_eq!(snap.steps, 1);
        assert_eq!(snap.layers.len(), 2);
        for (l, layer) in snap.layers.iter().enumerate() {
            let active = h.layer_code(l).sum() as usize;
            assert_eq!(layer.active_cells.len(), active);
            assert!(layer.min_reward <= layer.max_reward);
        }
    }
}
