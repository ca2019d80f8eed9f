//! Single-shot competitive coder.
//!
//! Activation is one feed-forward pass followed by local winner-take-some:
//! a unit turns on when fewer than `active_ratio` of its lateral neighbors are
//! at least as excited as it is, and stays off otherwise. The rule is per
//! unit; overlapping windows can still hold more or fewer winners than
//! `active_ratio` of their size. The chosen code is then projected back to
//! every source, and the reconstruction residual is pushed forward again so
//! the layer above can see how much of its input the code failed to explain.

use std::io::{self, BufRead, Write};

use crate::error::{ensure_size, Result};
use crate::geometry::{Int2, ReceptiveField};
use crate::grid::{DoubleBuffer, Grid};
use crate::prng::RandomSource;
use crate::sparse_coder::launch_sum;
use crate::storage::{self, PayloadReader, TokenReader};
use crate::substrate::{self, ExecutionTier};
use crate::visible::{check_descs, check_sources, forward_sum, reverse_sum, VisibleLayerDesc};

#[derive(Debug, Clone)]
struct VisibleLayer {
    desc: VisibleLayerDesc,
    field: ReceptiveField,
    weights: Grid,
    traces: Option<Grid>,
    reconstruction: Grid,
    residual: Grid,
}

#[derive(Debug, Clone)]
pub struct ComparisonSparseCoder {
    hidden_size: Int2,
    visible_layers: Vec<VisibleLayer>,
    visible_descs: Vec<VisibleLayerDesc>,

    hidden_activations: DoubleBuffer<Grid>,
    hidden_states: DoubleBuffer<Grid>,
    hidden_errors: DoubleBuffer<Grid>,
    hidden_biases: Grid,

    neighborhood: ReceptiveField,
    tier: ExecutionTier,
}

impl ComparisonSparseCoder {
    pub fn create_random(
        hidden_size: Int2,
        visible_descs: Vec<VisibleLayerDesc>,
        lateral_radius: i32,
        init_weight_range: (f32, f32),
        rng: &mut impl RandomSource,
    ) -> Result<Self> {
        check_descs(hidden_size, &visible_descs)?;

        let mut visible_layers = Vec::with_capacity(visible_descs.len());
        for desc in &visible_descs {
            let field = desc.field(hidden_size)?;
            let weights = Grid::random(hidden_size, field.slots(), init_weight_range, rng);
            let traces = desc
                .use_trace
                .then(|| Grid::new_3d(hidden_size, field.slots()));
            visible_layers.push(VisibleLayer {
                desc: *desc,
                field,
                weights,
                traces,
                reconstruction: Grid::new(desc.size),
                residual: Grid::new(desc.size),
            });
        }

        let hidden_biases = Grid::random(hidden_size, 1, init_weight_range, rng);
        let neighborhood = ReceptiveField::new(hidden_size, hidden_size, lateral_radius, true)?;
        let zeros = Grid::new(hidden_size);

        Ok(Self {
            hidden_size,
            visible_layers,
            visible_descs,
            hidden_activations: DoubleBuffer::splat(zeros.clone()),
            hidden_states: DoubleBuffer::splat(zeros.clone()),
            hidden_errors: DoubleBuffer::splat(zeros),
            hidden_biases,
            neighborhood,
            tier: ExecutionTier::Scalar,
        })
    }

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.tier = tier;
    }

    pub fn activate(&mut self, visible_states: &[&Grid], active_ratio: f32) -> Result<()> {
        check_sources(&self.visible_descs, visible_states)?;
        let tier = self.tier;

        // Feed-forward excitation, starting from the biases.
        self.hidden_activations.front_mut().copy_from(&self.hidden_biases);
        self.hidden_activations.swap();
        for (vl, state) in self.visible_layers.iter().zip(visible_states) {
            let (front, back) = self.hidden_activations.split();
            launch_sum(tier, front, back, |h| forward_sum(&vl.field, &vl.weights, state, h));
            self.hidden_activations.swap();
        }

        // Local competition.
        let acts = self.hidden_activations.back();
        let neighborhood = &self.neighborhood;
        substrate::launch(tier, self.hidden_states.front_mut().data_mut(), |h| {
            let own = acts.data()[h];
            let neighbors = neighborhood.forward(h);
            let at_least = neighbors
                .iter()
                .filter(|s| acts.data()[s.cell] >= own)
                .count();
            if (at_least as f32) < active_ratio * neighbors.len() as f32 {
                1.0
            } else {
                0.0
            }
        });
        self.hidden_states.swap();

        // Explaining away: reconstruct every source from the code.
        let states = self.hidden_states.back();
        for (vl, state) in self.visible_layers.iter_mut().zip(visible_states) {
            let (field, weights) = (&vl.field, &vl.weights);
            substrate::launch(tier, vl.reconstruction.data_mut(), |v| {
                reverse_sum(field, weights, states, v)
            });
            substrate::sub_into(
                tier,
                vl.residual.data_mut(),
                state.data(),
                vl.reconstruction.data(),
            );
        }

        self.hidden_errors.reset_with(|g| g.fill(0.0));
        for vl in &self.visible_layers {
            let (front, back) = self.hidden_errors.split();
            launch_sum(tier, front, back, |h| {
                forward_sum(&vl.field, &vl.weights, &vl.residual, h)
            });
            self.hidden_errors.swap();
        }

        Ok(())
    }

    pub fn learn(&mut self, weight_alpha: f32, bias_alpha: f32, active_ratio: f32) {
        self.update_biases(bias_alpha, active_ratio);

        let tier = self.tier;
        let states = self.hidden_states.back();
        for vl in &mut self.visible_layers {
            let rate = weight_alpha * vl.desc.alpha;
            let (field, residual) = (&vl.field, &vl.residual);
            substrate::launch_columns(tier, vl.weights.data_mut(), field.slots(), |h, w| {
                let state = states.data()[h];
                if state == 0.0 {
                    return;
                }
                for s in field.forward(h) {
                    w[s.slot] += rate * residual.data()[s.cell] * state;
                }
            });
        }
    }

    /// Reward-modulated learning. Connections of sources with traces are
    /// credited through `e = weight_lambda·e + residual·state`.
    pub fn learn_trace(
        &mut self,
        rewards: &Grid,
        weight_alpha: f32,
        weight_lambda: f32,
        bias_alpha: f32,
        active_ratio: f32,
    ) -> Result<()> {
        ensure_size("reward grid", self.hidden_size, rewards.size())?;
        self.update_biases(bias_alpha, active_ratio);

        let tier = self.tier;
        let states = self.hidden_states.back();
        let r = rewards.data();
        for vl in &mut self.visible_layers {
            let rate = weight_alpha * vl.desc.alpha;
            let (field, residual) = (&vl.field, &vl.residual);
            let slots = field.slots();

            match &mut vl.traces {
                Some(traces) => substrate::launch_columns_pair(
                    tier,
                    vl.weights.data_mut(),
                    traces.data_mut(),
                    slots,
                    |h, w, e| {
                        let state = states.data()[h];
                        for s in field.forward(h) {
                            e[s.slot] = weight_lambda * e[s.slot] + residual.data()[s.cell] * state;
                            w[s.slot] += rate * r[h] * e[s.slot];
                        }
                    },
                ),
                None => substrate::launch_columns(tier, vl.weights.data_mut(), slots, |h, w| {
                    let state = states.data()[h];
                    if state == 0.0 {
                        return;
                    }
                    for s in field.forward(h) {
                        w[s.slot] += rate * r[h] * residual.data()[s.cell] * state;
                    }
                }),
            }
        }
        Ok(())
    }

    fn update_biases(&mut self, bias_alpha: f32, active_ratio: f32) {
        let states = self.hidden_states.back();
        substrate::launch_columns(self.tier, self.hidden_biases.data_mut(), 1, |h, b| {
            b[0] += bias_alpha * (active_ratio - states.data()[h]);
        });
    }

    pub fn clear_state(&mut self) {
        self.hidden_activations.reset_with(|g| g.fill(0.0));
        self.hidden_states.reset_with(|g| g.fill(0.0));
        self.hidden_errors.reset_with(|g| g.fill(0.0));
        for vl in &mut self.visible_layers {
            vl.reconstruction.fill(0.0);
            vl.residual.fill(0.0);
            if let Some(t) = &mut vl.traces {
                t.fill(0.0);
            }
        }
    }

    pub fn hidden_states(&self) -> &Grid {
        self.hidden_states.back()
    }

    pub fn hidden_activations(&self) -> &Grid {
        self.hidden_activations.back()
    }

    /// Residuals of all sources projected forward through the tied weights.
    pub fn hidden_errors(&self) -> &Grid {
        self.hidden_errors.back()
    }

    pub fn hidden_biases(&self) -> &Grid {
        &self.hidden_biases
    }

    pub fn hidden_size(&self) -> Int2 {
        self.hidden_size
    }

    pub fn num_visible_layers(&self) -> usize {
        self.visible_layers.len()
    }

    pub fn visible_layer_desc(&self, i: usize) -> &VisibleLayerDesc {
        &self.visible_layers[i].desc
    }

    pub fn weights(&self, i: usize) -> &Grid {
        &self.visible_layers[i].weights
    }

    pub fn reconstruction(&self, i: usize) -> &Grid {
        &self.visible_layers[i].reconstruction
    }

    pub fn residual(&self, i: usize) -> &Grid {
        &self.visible_layers[i].residual
    }

    pub fn write_to_stream<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_grid_text(w, self.hidden_states.back())?;
        storage::write_grid_text(w, &self.hidden_biases)?;
        for vl in &self.visible_layers {
            storage::write_grid_text(w, &vl.weights)?;
        }
        Ok(())
    }

    pub fn read_from_stream<R: BufRead>(&mut self, r: &mut TokenReader<R>) -> Result<()> {
        r.read_grid(self.hidden_states.front_mut())?;
        self.hidden_states.swap();
        r.read_grid(&mut self.hidden_biases)?;
        for vl in &mut self.visible_layers {
            r.read_grid(&mut vl.weights)?;
        }
        Ok(())
    }

    pub(crate) fn write_image(&self, buf: &mut Vec<u8>) {
        storage::push_grid(buf, self.hidden_states.back());
        storage::push_grid(buf, &self.hidden_biases);
        for vl in &self.visible_layers {
            storage::push_grid(buf, &vl.weights);
        }
    }

    pub(crate) fn read_image(&mut self, r: &mut PayloadReader<'_>) -> Result<()> {
        r.read_grid(self.hidden_states.front_mut())?;
        self.hidden_states.swap();
        r.read_grid(&mut self.hidden_biases)?;
        for vl in &mut self.visible_layers {
            r.read_grid(&mut vl.weights)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    fn make_coder(size: i32, seed: u64) -> ComparisonSparseCoder {
        let mut rng = Prng::new(seed);
        ComparisonSparseCoder::create_random(
            Int2::new(size, size),
            vec![VisibleLayerDesc::new(Int2::new(size, size), 2)],
            1,
            (-0.05, 0.05),
            &mut rng,
        )
        .unwrap()
    }

    fn random_input(size: i32, rng: &mut Prng) -> Grid {
        let n = (size * size) as usize;
        let values = (0..n).map(|_| rng.next_f32_01()).collect();
        Grid::from_values(Int2::new(size, size), values)
    }

    #[test]
    fn mean_window_occupancy_tracks_ratio() {
        let mut coder = make_coder(16, 3);
        let mut rng = Prng::new(4);
        let ratio = 0.2;
        let mut total = 0.0;
        let mut windows = 0usize;

        for _ in 0..8 {
            let input = random_input(16, &mut rng);
            coder.activate(&[&input], ratio).unwrap();
            let states = coder.hidden_states();
            for y in 1..15 {
                for x in 1..15 {
                    let mut active = 0.0;
                    for dy in 0..3 {
                        for dx in 0..3 {
                            active += states.get(x + dx - 1, y + dy - 1);
                        }
                    }
                    total += active;
                    windows += 1;
                }
            }
        }

        let mean = total / windows as f32;
        let target = ratio * 9.0;
        assert!((mean - target).abs() <= 1.0, "mean active {mean}, target {target}");
    }

    #[test]
    fn every_unit_obeys_the_rank_rule() {
        let mut coder = make_coder(16, 21);
        let mut rng = Prng::new(22);
        let ratio = 0.2;

        for _ in 0..8 {
            let input = random_input(16, &mut rng);
            coder.activate(&[&input], ratio).unwrap();
            let acts = coder.hidden_activations().data();
            let states = coder.hidden_states().data();

            for h in 0..256 {
                let neighbors = coder.neighborhood.forward(h);
                let stronger = neighbors.iter().filter(|s| acts[s.cell] >= acts[h]).count();
                let quota = ratio * neighbors.len() as f32;
                if states[h] > 0.0 {
                    assert!((stronger as f32) < quota, "unit {h} active with {stronger} stronger");
                } else {
                    assert!((stronger as f32) >= quota, "unit {h} silent with {stronger} stronger");
                }
            }
        }
    }

    #[test]
    fn trace_learning_accumulates_with_decay() {
        let mut rng = Prng::new(23);
        let mut coder = ComparisonSparseCoder::create_random(
            Int2::new(8, 8),
            vec![VisibleLayerDesc::new(Int2::new(8, 8), 2).with_trace(true)],
            1,
            (-0.05, 0.05),
            &mut rng,
        )
        .unwrap();
        let input = random_input(8, &mut Prng::new(24));
        coder.activate(&[&input], 0.2).unwrap();

        let w0 = coder.weights(0).clone();
        let ones = Grid::filled(Int2::new(8, 8), 1, 1.0);
        coder.learn_trace(&ones, 0.1, 0.5, 0.0, 0.2).unwrap();
        let w1 = coder.weights(0).clone();

        // Same code and residual: the trace becomes 0.5·e + e, committed at reward 2.
        let twos = Grid::filled(Int2::new(8, 8), 1, 2.0);
        coder.learn_trace(&twos, 0.1, 0.5, 0.0, 0.2).unwrap();
        let w2 = coder.weights(0);

        let mut moved = 0;
        for i in 0..w0.len() {
            let first = w1.data()[i] - w0.data()[i];
            let second = w2.data()[i] - w1.data()[i];
            if first != 0.0 {
                moved += 1;
            }
            assert!(
                (second - 3.0 * first).abs() <= 1e-4 * first.abs() + 1e-7,
                "slot {i}: first={first} second={second}"
            );
        }
        assert!(moved > 0);
    }

    #[test]
    fn same_seed_same_code() {
        let mut a = make_coder(8, 12);
        let mut b = make_coder(8, 12);
        let input = random_input(8, &mut Prng::new(1));
        a.activate(&[&input], 0.2).unwrap();
        b.activate(&[&input], 0.2).unwrap();
        assert_eq!(a.hidden_states(), b.hidden_states());
        assert_eq!(a.hidden_errors(), b.hidden_errors());
    }

    #[test]
    fn residual_is_input_minus_reconstruction() {
        let mut coder = make_coder(8, 5);
        let input = random_input(8, &mut Prng::new(6));
        coder.activate(&[&input], 0.2).unwrap();
        for v in 0..64 {
            let expected = input.data()[v] - coder.reconstruction(0).data()[v];
            assert!((coder.residual(0).data()[v] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn learning_reduces_reconstruction_error() {
        let mut coder = make_coder(8, 7);
        let input = random_input(8, &mut Prng::new(8));

        coder.activate(&[&input], 0.2).unwrap();
        let before = coder.residual(0).sum_squares();

        for _ in 0..200 {
            coder.activate(&[&input], 0.2).unwrap();
            coder.learn(0.05, 0.0, 0.2);
        }
        coder.activate(&[&input], 0.2).unwrap();
        let after = coder.residual(0).sum_squares();

        assert!(after < 0.5 * before, "before={before} after={after}");
    }

    #[test]
    fn biases_track_active_ratio() {
        let mut coder = make_coder(8, 9);
        let input = random_input(8, &mut Prng::new(10));
        coder.activate(&[&input], 0.2).unwrap();

        let before = coder.hidden_biases().clone();
        let states = coder.hidden_states().clone();
        coder.learn(0.0, 0.1, 0.2);

        for h in 0..64 {
            let delta = coder.hidden_biases().data()[h] - before.data()[h];
            if states.data()[h] > 0.0 {
                assert!(delta < 0.0);
            } else {
                assert!(delta > 0.0);
            }
        }
    }

    #[test]
    fn stream_roundtrip_restores_code() {
        let mut trained = make_coder(8, 13);
        let mut rng = Prng::new(14);
        for _ in 0..10 {
            let input = random_input(8, &mut rng);
            trained.activate(&[&input], 0.2).unwrap();
            trained.learn(0.05, 0.01, 0.2);
        }

        let mut text = Vec::new();
        trained.write_to_stream(&mut text).unwrap();
        let mut restored = make_coder(8, 99);
        restored
            .read_from_stream(&mut TokenReader::new(text.as_slice()))
            .unwrap();

        let sample = random_input(8, &mut rng);
        trained.activate(&[&sample], 0.2).unwrap();
        restored.activate(&[&sample], 0.2).unwrap();
        assert_eq!(trained.hidden_states(), restored.hidden_states());
    }

    #[test]
    fn rejects_wrong_reward_size() {
        let mut coder = make_coder(8, 1);
        let rewards = Grid::new(Int2::new(4, 4));
        assert!(coder.learn_trace(&rewards, 0.1, 0.9, 0.01, 0.2).is_err());
    }
}
