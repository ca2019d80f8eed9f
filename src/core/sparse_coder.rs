//! Iteratively settled sparse coder.
//!
//! Hidden units compete to explain the visible input. Each settle iteration
//! projects the current reconstruction residual onto the hidden units,
//! integrates that drive (with leak and lateral inhibition) and lets units
//! whose running activation crosses their threshold spike. Spikes accumulate
//! into spike levels with a shrinking step `1/(1+t)`, and the residual is
//! recomputed from the levels, so later iterations only refine what earlier
//! ones left unexplained.

use std::io::{self, BufRead, Write};

use crate::error::{ensure_size, Result};
use crate::geometry::{Int2, ReceptiveField};
use crate::grid::{DoubleBuffer, Grid};
use crate::prng::RandomSource;
use crate::storage::{self, TokenReader};
use crate::substrate::{self, ExecutionTier};
use crate::visible::{check_descs, check_sources, forward_sum, reverse_sum, VisibleLayerDesc};

/// Per-unit state machine of spiking units.
///
/// `Idle → Integrating → Spiked → Idle`: a unit integrates drive until its
/// running activation exceeds the threshold, spikes, and its activation
/// resets to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    Integrating,
    Spiked,
}

impl UnitState {
    pub(crate) fn classify(state: f32, activation: f32) -> Self {
        if state > 0.0 {
            UnitState::Spiked
        } else if activation != 0.0 {
            UnitState::Integrating
        } else {
            UnitState::Idle
        }
    }
}

#[derive(Debug, Clone)]
struct VisibleLayer {
    desc: VisibleLayerDesc,
    field: ReceptiveField,
    weights: Grid,
    traces: Option<Grid>,
    input: Grid,
    reconstruction: Grid,
    residual: Grid,
}

#[derive(Debug, Clone)]
pub struct SparseCoder {
    hidden_size: Int2,
    visible_layers: Vec<VisibleLayer>,
    visible_descs: Vec<VisibleLayerDesc>,

    hidden_summation: DoubleBuffer<Grid>,
    hidden_activations: DoubleBuffer<Grid>,
    hidden_states: DoubleBuffer<Grid>,
    spike_levels: DoubleBuffer<Grid>,
    hidden_thresholds: Grid,

    lateral_field: ReceptiveField,
    lateral_weights: Grid,

    residual_energy: Vec<f32>,
    tier: ExecutionTier,
}

impl SparseCoder {
    /// Build a coder with uniformly random forward weights.
    ///
    /// Lateral weights start at zero and grow only through learning.
    pub fn create_random(
        hidden_size: Int2,
        visible_descs: Vec<VisibleLayerDesc>,
        lateral_radius: i32,
        init_weight_range: (f32, f32),
        init_threshold_range: (f32, f32),
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
                input: Grid::new(desc.size),
                reconstruction: Grid::new(desc.size),
                residual: Grid::new(desc.size),
            });
        }

        let lateral_field = ReceptiveField::new(hidden_size, hidden_size, lateral_radius, true)?;
        let lateral_weights = Grid::new_3d(hidden_size, lateral_field.slots());

        let hidden_thresholds = Grid::random(hidden_size, 1, init_threshold_range, rng);
        let zeros = Grid::new(hidden_size);
        Ok(Self {
            hidden_size,
            visible_layers,
            visible_descs,
            hidden_summation: DoubleBuffer::splat(zeros.clone()),
            hidden_activations: DoubleBuffer::splat(zeros.clone()),
            hidden_states: DoubleBuffer::splat(zeros.clone()),
            spike_levels: DoubleBuffer::splat(zeros),
            hidden_thresholds,
            lateral_field,
            lateral_weights,
            residual_energy: Vec::new(),
            tier: ExecutionTier::Scalar,
        })
    }

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.tier = tier;
    }

    /// Settle a sparse code for `visible_states`.
    ///
    /// `iterations` is clamped to at least one. `leak` is the fraction of
    /// running activation lost per iteration.
    pub fn activate(&mut self, visible_states: &[&Grid], iterations: usize, leak: f32) -> Result<()> {
        check_sources(&self.visible_descs, visible_states)?;

        for (vl, state) in self.visible_layers.iter_mut().zip(visible_states) {
            vl.input.copy_from(state);
        }

        self.hidden_summation.reset_with(|g| g.fill(0.0));
        self.hidden_activations.reset_with(|g| g.fill(0.0));
        self.hidden_states.reset_with(|g| g.fill(0.0));
        self.spike_levels.reset_with(|g| g.fill(0.0));
        self.residual_energy.clear();

        // Empty code: the residual is the input itself.
        self.reconstruct();

        for t in 0..iterations.max(1) {
            let scale = 1.0 / (1.0 + t as f32);
            self.accumulate_summation();
            self.integrate(scale, leak);
            self.accumulate_levels(scale);
            let energy = self.reconstruct();
            self.residual_energy.push(energy);
        }

        Ok(())
    }

    fn accumulate_summation(&mut self) {
        let tier = self.tier;
        self.hidden_summation.reset_with(|g| g.fill(0.0));

        for vl in &self.visible_layers {
            let (front, back) = self.hidden_summation.split();
            launch_sum(tier, front, back, |h| {
                forward_sum(&vl.field, &vl.weights, &vl.residual, h)
            });
            self.hidden_summation.swap();
        }
    }

    fn integrate(&mut self, scale: f32, leak: f32) {
        let tier = self.tier;
        let summation = self.hidden_summation.back();
        let thresholds = &self.hidden_thresholds;
        let lateral_field = &self.lateral_field;
        let lateral_weights = &self.lateral_weights;
        let (act_front, act_back) = self.hidden_activations.split();
        let (state_front, state_back) = self.hidden_states.split();

        substrate::launch_pair(
            tier,
            act_front.data_mut(),
            state_front.data_mut(),
            |h| {
                let inhibition = forward_sum(lateral_field, lateral_weights, state_back, h);
                let act = (1.0 - leak) * act_back.data()[h]
                    + scale * (summation.data()[h] - inhibition);

                if act > thresholds.data()[h] {
                    (0.0, 1.0)
                } else {
                    (act, 0.0)
                }
            },
        );

        self.hidden_activations.swap();
        self.hidden_states.swap();
    }

    fn accumulate_levels(&mut self, scale: f32) {
        let states = self.hidden_states.back();
        let (front, back) = self.spike_levels.split();
        launch_sum(self.tier, front, back, |h| scale * states.data()[h]);
        self.spike_levels.swap();
    }

    /// Recompute every source's residual from the spike levels.
    /// Returns the summed squared residual.
    fn reconstruct(&mut self) -> f32 {
        let tier = self.tier;
        let levels = self.spike_levels.back();
        let mut energy = 0.0;

        for vl in &mut self.visible_layers {
            let (field, weights) = (&vl.field, &vl.weights);
            substrate::launch(tier, vl.reconstruction.data_mut(), |v| {
                reverse_sum(field, weights, levels, v)
            });
            substrate::sub_into(
                tier,
                vl.residual.data_mut(),
                vl.input.data(),
                vl.reconstruction.data(),
            );
            energy += vl.residual.sum_squares();
        }

        energy
    }

    /// Homeostatic thresholds, error-correcting dictionary update and
    /// anti-Hebbian lateral decorrelation.
    pub fn learn(
        &mut self,
        weight_alpha: f32,
        lateral_alpha: f32,
        threshold_alpha: f32,
        active_ratio: f32,
    ) {
        let ones = Grid::filled(self.hidden_size, 1, 1.0);
        self.apply_learning(&ones, weight_alpha, lateral_alpha, threshold_alpha, active_ratio, None);
    }

    /// Reward-modulated variant: every delta is scaled by the per-unit
    /// `rewards`, and sources with traces credit their connections through
    /// an eligibility trace decayed by `weight_trace_lambda`.
    pub fn learn_trace(
        &mut self,
        rewards: &Grid,
        weight_alpha: f32,
        lateral_alpha: f32,
        threshold_alpha: f32,
        active_ratio: f32,
        weight_trace_lambda: f32,
    ) -> Result<()> {
        ensure_size("reward grid", self.hidden_size, rewards.size())?;
        self.apply_learning(
            rewards,
            weight_alpha,
            lateral_alpha,
            threshold_alpha,
            active_ratio,
            Some(weight_trace_lambda),
        );
        Ok(())
    }

    fn apply_learning(
        &mut self,
        rewards: &Grid,
        weight_alpha: f32,
        lateral_alpha: f32,
        threshold_alpha: f32,
        active_ratio: f32,
        trace_lambda: Option<f32>,
    ) {
        let tier = self.tier;
        let levels = self.spike_levels.back();
        let r = rewards.data();

        substrate::launch_columns(tier, self.hidden_thresholds.data_mut(), 1, |h, t| {
            let fired = levels.data()[h].min(1.0);
            t[0] += threshold_alpha * r[h] * (fired - active_ratio);
        });

        for vl in &mut self.visible_layers {
            let rate = weight_alpha * vl.desc.alpha;
            let field = &vl.field;
            let residual = &vl.residual;
            let slots = field.slots();

            match (&mut vl.traces, trace_lambda) {
                (Some(traces), Some(lambda)) => substrate::launch_columns_pair(
                    tier,
                    vl.weights.data_mut(),
                    traces.data_mut(),
                    slots,
                    |h, w, e| {
                        let lh = levels.data()[h];
                        for s in field.forward(h) {
                            e[s.slot] = lambda * e[s.slot] + lh * residual.data()[s.cell];
                            w[s.slot] += rate * r[h] * e[s.slot];
                        }
                    },
                ),
                _ => substrate::launch_columns(tier, vl.weights.data_mut(), slots, |h, w| {
                    let lh = levels.data()[h];
                    if lh == 0.0 {
                        return;
                    }
                    for s in field.forward(h) {
                        w[s.slot] += rate * r[h] * lh * residual.data()[s.cell];
                    }
                }),
            }
        }

        let lateral_field = &self.lateral_field;
        let target = active_ratio * active_ratio;
        substrate::launch_columns(
            tier,
            self.lateral_weights.data_mut(),
            lateral_field.slots(),
            |h, w| {
                let lh = levels.data()[h].min(1.0);
                for s in lateral_field.forward(h) {
                    let ln = levels.data()[s.cell].min(1.0);
                    w[s.slot] = (w[s.slot] + lateral_alpha * r[h] * (lh * ln - target)).max(0.0);
                }
            },
        );
    }

    /// Drop all transient state (activations, spikes, traces).
    pub fn clear_state(&mut self) {
        self.hidden_summation.reset_with(|g| g.fill(0.0));
        self.hidden_activations.reset_with(|g| g.fill(0.0));
        self.hidden_states.reset_with(|g| g.fill(0.0));
        self.spike_levels.reset_with(|g| g.fill(0.0));
        for vl in &mut self.visible_layers {
            if let Some(t) = &mut vl.traces {
                t.fill(0.0);
            }
        }
    }

    pub fn unit_state(&self, x: usize, y: usize) -> UnitState {
        UnitState::classify(
            self.hidden_states.back().get(x, y),
            self.hidden_activations.back().get(x, y),
        )
    }

    /// Spike pattern of the last settle iteration (the emitted code).
    pub fn hidden_states(&self) -> &Grid {
        self.hidden_states.back()
    }

    /// Spikes accumulated over all settle iterations, weighted by `1/(1+t)`.
    pub fn spike_levels(&self) -> &Grid {
        self.spike_levels.back()
    }

    pub fn hidden_activations(&self) -> &Grid {
        self.hidden_activations.back()
    }

    pub fn hidden_thresholds(&self) -> &Grid {
        &self.hidden_thresholds
    }

    pub fn lateral_weights(&self) -> &Grid {
        &self.lateral_weights
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

    /// Summed squared residual after each settle iteration of the last
    /// `activate`.
    pub fn residual_energy(&self) -> &[f32] {
        &self.residual_energy
    }

    pub fn write_to_stream<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_grid_text(w, self.hidden_states.back())?;
        storage::write_grid_text(w, &self.hidden_thresholds)?;
        storage::write_grid_text(w, &self.lateral_weights)?;
        for vl in &self.visible_layers {
            storage::write_grid_text(w, &vl.weights)?;
        }
        Ok(())
    }

    pub fn read_from_stream<R: BufRead>(&mut self, r: &mut TokenReader<R>) -> Result<()> {
        r.read_grid(self.hidden_states.front_mut())?;
        self.hidden_states.swap();
        r.read_grid(&mut self.hidden_thresholds)?;
        r.read_grid(&mut self.lateral_weights)?;
        for vl in &mut self.visible_layers {
            r.read_grid(&mut vl.weights)?;
        }
        Ok(())
    }
}

/// `front[i] = back[i] + term(i)`: one accumulation pass of a ping-pong sum.
pub(crate) fn launch_sum<F>(tier: ExecutionTier, front: &mut Grid, back: &Grid, term: F)
where
    F: Fn(usize) -> f32 + Sync + Send,
{
    substrate::launch(tier, front.data_mut(), |i| back.data()[i] + term(i));
}
