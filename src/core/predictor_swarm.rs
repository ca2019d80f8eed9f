//! Stochastic spiking action selector.
//!
//! Structurally a [`Predictor`](crate::predictor::Predictor) whose output
//! units integrate their drive plus exploration noise and spike above ½.
//! Learning is policy-gradient (OLPOMDP): every connection keeps an
//! eligibility trace of `(spike − expected spike) · source`, and a scalar
//! reward commits it.

use crate::error::{ensure_size, Result};
use crate::geometry::{Int2, ReceptiveField};
use crate::grid::{DoubleBuffer, Grid};
use crate::prng::RandomSource;
use crate::sparse_coder::{launch_sum, UnitState};
use crate::substrate::{self, ExecutionTier};
use crate::visible::{check_descs, check_sources, forward_sum, reverse_sum, VisibleLayerDesc};

const SPIKE_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
struct VisibleLayer {
    desc: VisibleLayerDesc,
    field: ReceptiveField,
    weights: Grid,
    traces: Grid,
    input: Grid,
    errors: Grid,
}

#[derive(Debug, Clone)]
pub struct PredictorSwarm {
    hidden_size: Int2,
    visible_layers: Vec<VisibleLayer>,
    visible_descs: Vec<VisibleLayerDesc>,

    hidden_summation: DoubleBuffer<Grid>,
    hidden_activations: DoubleBuffer<Grid>,
    hidden_states: DoubleBuffer<Grid>,
    hidden_errors: Grid,
    noise: Grid,

    tier: ExecutionTier,
}

impl PredictorSwarm {
    pub fn create_random(
        hidden_size: Int2,
        visible_descs: Vec<VisibleLayerDesc>,
        init_weight_range: (f32, f32),
        rng: &mut impl RandomSource,
    ) -> Result<Self> {
        check_descs(hidden_size, &visible_descs)?;

        let mut visible_layers = Vec::with_capacity(visible_descs.len());
        for desc in &visible_descs {
            let field = desc.field(hidden_size)?;
            let weights = Grid::random(hidden_size, field.slots(), init_weight_range, rng);
            visible_layers.push(VisibleLayer {
                desc: *desc,
                traces: Grid::new_3d(hidden_size, field.slots()),
                field,
                weights,
                input: Grid::new(desc.size),
                errors: Grid::new(desc.size),
            });
        }

        let zeros = Grid::new(hidden_size);
        Ok(Self {
            hidden_size,
            visible_layers,
            visible_descs,
            hidden_summation: DoubleBuffer::splat(zeros.clone()),
            hidden_activations: DoubleBuffer::splat(zeros.clone()),
            hidden_states: DoubleBuffer::splat(zeros.clone()),
            hidden_errors: zeros.clone(),
            noise: zeros,
            tier: ExecutionTier::Scalar,
        })
    }

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.tier = tier;
    }

    /// Integrate `act = (1 − leak)·act + sum + U(−noise, noise)` and spike
    /// (resetting `act`) above ½.
    pub fn activate(
        &mut self,
        visible_states: &[&Grid],
        noise: f32,
        leak: f32,
        rng: &mut impl RandomSource,
    ) -> Result<()> {
        check_sources(&self.visible_descs, visible_states)?;
        let tier = self.tier;

        for (vl, state) in self.visible_layers.iter_mut().zip(visible_states) {
            vl.input.copy_from(state);
        }

        self.hidden_summation.reset_with(|g| g.fill(0.0));
        for vl in &self.visible_layers {
            let (front, back) = self.hidden_summation.split();
            launch_sum(tier, front, back, |h| {
                forward_sum(&vl.field, &vl.weights, &vl.input, h)
            });
            self.hidden_summation.swap();
        }

        // Pre-generate noise (the RNG is not shared with launches).
        for n in self.noise.data_mut() {
            *n = rng.gen_range_f32(-noise, noise);
        }

        let sum = self.hidden_summation.back();
        let jitter = &self.noise;
        let (act_front, act_back) = self.hidden_activations.split();
        substrate::launch_pair(
            tier,
            act_front.data_mut(),
            self.hidden_states.front_mut().data_mut(),
            |h| {
                let act = (1.0 - leak) * act_back.data()[h] + sum.data()[h] + jitter.data()[h];
                if act > SPIKE_THRESHOLD {
                    (0.0, 1.0)
                } else {
                    (act, 0.0)
                }
            },
        );
        self.hidden_activations.swap();
        self.hidden_states.swap();

        Ok(())
    }

    /// Back-project `targets − spikes` onto every source.
    pub fn propagate_error(&mut self, targets: &Grid) -> Result<()> {
        ensure_size("swarm target", self.hidden_size, targets.size())?;
        let tier = self.tier;

        substrate::sub_into(
            tier,
            self.hidden_errors.data_mut(),
            targets.data(),
            self.hidden_states.back().data(),
        );

        let errors = &self.hidden_errors;
        for vl in &mut self.visible_layers {
            let (field, weights) = (&vl.field, &vl.weights);
            substrate::launch(tier, vl.errors.data_mut(), |v| {
                reverse_sum(field, weights, errors, v)
            });
        }
        Ok(())
    }

    /// OLPOMDP update for the last activation.
    pub fn learn(&mut self, reward: f32, alpha: f32, trace_decay: f32) {
        let tier = self.tier;
        let sum = self.hidden_summation.back();
        let spikes = self.hidden_states.back();

        for vl in &mut self.visible_layers {
            let rate = alpha * vl.desc.alpha;
            let (field, input) = (&vl.field, &vl.input);
            substrate::launch_columns_pair(
                tier,
                vl.weights.data_mut(),
                vl.traces.data_mut(),
                field.slots(),
                |h, w, e| {
                    let surprise = spikes.data()[h] - sum.data()[h].clamp(0.0, 1.0);
                    for s in field.forward(h) {
                        e[s.slot] = trace_decay * e[s.slot] + surprise * input.data()[s.cell];
                        w[s.slot] += rate * reward * e[s.slot];
                    }
                },
            );
        }
    }

    pub fn clear_state(&mut self) {
        self.hidden_summation.reset_with(|g| g.fill(0.0));
        self.hidden_activations.reset_with(|g| g.fill(0.0));
        self.hidden_states.reset_with(|g| g.fill(0.0));
        for vl in &mut self.visible_layers {
            vl.traces.fill(0.0);
            vl.errors.fill(0.0);
        }
    }

    pub fn unit_state(&self, x: usize, y: usize) -> UnitState {
        UnitState::classify(
            self.hidden_states.back().get(x, y),
            self.hidden_activations.back().get(x, y),
        )
    }

    /// Spike pattern of the last activation.
    pub fn hidden_states(&self) -> &Grid {
        self.hidden_states.back()
    }

    pub fn hidden_activations(&self) -> &Grid {
        self.hidden_activations.back()
    }

    pub fn visible_errors(&self, i: usize) -> &Grid {
        &self.visible_layers[i].errors
    }

    pub fn hidden_size(&self) -> Int2 {
        self.hidden_size
    }

    pub fn weights(&self, i: usize) -> &Grid {
        &self.visible_layers[i].weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    fn single_unit(weight: f32) -> PredictorSwarm {
        let size = Int2::new(1, 1);
        PredictorSwarm::create_random(
            size,
            vec![VisibleLayerDesc::new(size, 0)],
            (weight, weight),
            &mut Prng::new(1),
        )
        .unwrap()
    }

    #[test]
    fn spikes_and_resets_without_noise() {
        let mut swarm = single_unit(0.3);
        let mut rng = Prng::new(2);
        let input = Grid::filled(Int2::new(1, 1), 1, 1.0);

        swarm.activate(&[&input], 0.0, 0.0, &mut rng).unwrap();
        assert_eq!(swarm.unit_state(0, 0), UnitState::Integrating);

        // 0.3 + 0.3 crosses ½.
        swarm.activate(&[&input], 0.0, 0.0, &mut rng).unwrap();
        assert_eq!(swarm.unit_state(0, 0), UnitState::Spiked);
        assert_eq!(swarm.hidden_activations().get(0, 0), 0.0);

        let silent = Grid::new(Int2::new(1, 1));
        swarm.activate(&[&silent], 0.0, 0.0, &mut rng).unwrap();
        assert_eq!(swarm.unit_state(0, 0), UnitState::Idle);
    }

    #[test]
    fn rewarded_spikes_strengthen_weights() {
        let mut swarm = single_unit(0.3);
        let mut rng = Prng::new(9);
        let input = Grid::filled(Int2::new(1, 1), 1, 1.0);

        for _ in 0..200 {
            swarm.activate(&[&input], 1.0, 1.0, &mut rng).unwrap();
            let reward = swarm.hidden_states().get(0, 0);
            swarm.learn(reward, 0.05, 0.0);
        }
        assert!(swarm.weights(0).data()[0] > 0.3);
    }

    #[test]
    fn error_is_projected_through_reverse_windows() {
        let size = Int2::new(2, 1);
        let mut swarm = PredictorSwarm::create_random(
            size,
            vec![VisibleLayerDesc::new(size, 1)],
            (0.5, 0.5),
            &mut Prng::new(1),
        )
        .unwrap();
        let input = Grid::filled(size, 1, 1.0);

        // Both units see both inputs: drive 1.0 spikes each of them.
        swarm.activate(&[&input], 0.0, 0.0, &mut Prng::new(2)).unwrap();
        assert_eq!(swarm.hidden_states().data(), &[1.0, 1.0]);

        let target = Grid::from_values(size, vec![1.0, 0.0]);
        swarm.propagate_error(&target).unwrap();
        // Errors (0, −1), each visible cell gets 0.5·0 + 0.5·(−1).
        assert_eq!(swarm.visible_errors(0).data(), &[-0.5, -0.5]);

        assert!(swarm.propagate_error(&Grid::new(Int2::new(1, 1))).is_err());
    }

    #[test]
    fn same_seed_same_actions() {
        let size = Int2::new(4, 4);
        let make = || {
            PredictorSwarm::create_random(
                size,
                vec![VisibleLayerDesc::new(Int2::new(8, 8), 2)],
                (-0.5, 0.5),
                &mut Prng::new(5),
            )
            .unwrap()
        };
        let (mut a, mut b) = (make(), make());
        let input = Grid::filled(Int2::new(8, 8), 1, 1.0);
        let (mut ra, mut rb) = (Prng::new(6), Prng::new(6));
        for _ in 0..5 {
            a.activate(&[&input], 0.3, 0.1, &mut ra).unwrap();
            b.activate(&[&input], 0.3, 0.1, &mut rb).unwrap();
            assert_eq!(a.hidden_states(), b.hidden_states());
        }
    }
}
