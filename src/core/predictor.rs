//! Locally connected linear predictor.
//!
//! Each output cell is a weighted sum over windows of its sources. The
//! prediction made on one step is scored against the targets that arrive on
//! the next one, so the predictor keeps the sources and the prediction of the
//! previous activation around for error propagation and learning.

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
    /// `[current, previous]` source values.
    states: DoubleBuffer<Grid>,
    errors: Grid,
}

#[derive(Debug, Clone)]
pub struct Predictor {
    hidden_size: Int2,
    visible_layers: Vec<VisibleLayer>,
    visible_descs: Vec<VisibleLayerDesc>,

    hidden_summation: DoubleBuffer<Grid>,
    /// Back is the current prediction, front the previous one.
    hidden_states: DoubleBuffer<Grid>,
    hidden_errors: Grid,

    tier: ExecutionTier,
}

impl Predictor {
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
            let traces = desc
                .use_trace
                .then(|| Grid::new_3d(hidden_size, field.slots()));
            visible_layers.push(VisibleLayer {
                desc: *desc,
                field,
                weights,
                traces,
                states: DoubleBuffer::splat(Grid::new(desc.size)),
                errors: Grid::new(desc.size),
            });
        }

        let zeros = Grid::new(hidden_size);
        Ok(Self {
            hidden_size,
            visible_layers,
            visible_descs,
            hidden_summation: DoubleBuffer::splat(zeros.clone()),
            hidden_states: DoubleBuffer::splat(zeros.clone()),
            hidden_errors: zeros,
            tier: ExecutionTier::Scalar,
        })
    }

    pub fn set_execution_tier(&mut self, tier: ExecutionTier) {
        self.tier = tier;
    }

    /// Predict from `visible_states`.
    ///
    /// With `threshold` the sum is clamped to `[0, 1]` and binarised at ½
    /// (a discrete decision, nothing carried between steps); otherwise the
    /// continuous sum is the prediction.
    pub fn activate(&mut self, visible_states: &[&Grid], threshold: bool) -> Result<()> {
        check_sources(&self.visible_descs, visible_states)?;
        let tier = self.tier;

        for (vl, state) in self.visible_layers.iter_mut().zip(visible_states) {
            // The old back becomes the previous source once we swap.
            vl.states.front_mut().copy_from(state);
            vl.states.swap();
        }

        self.hidden_summation.reset_with(|g| g.fill(0.0));
        for vl in &self.visible_layers {
            let (front, back) = self.hidden_summation.split();
            launch_sum(tier, front, back, |h| {
                forward_sum(&vl.field, &vl.weights, vl.states.back(), h)
            });
            self.hidden_summation.swap();
        }

        let sum = self.hidden_summation.back();
        substrate::launch(tier, self.hidden_states.front_mut().data_mut(), |h| {
            let s = sum.data()[h];
            if threshold {
                if s.clamp(0.0, 1.0) > 0.5 {
                    1.0
                } else {
                    0.0
                }
            } else {
                s
            }
        });
        self.hidden_states.swap();

        Ok(())
    }

    /// Back-project `targets − previous prediction` onto every source.
    pub fn propagate_error(&mut self, targets: &Grid) -> Result<()> {
        ensure_size("prediction target", self.hidden_size, targets.size())?;
        let tier = self.tier;

        substrate::sub_into(
            tier,
            self.hidden_errors.data_mut(),
            targets.data(),
            self.hidden_states.front().data(),
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

    /// Delta rule on the previous step: the sources that produced the
    /// previous prediction move it toward `targets`.
    pub fn learn(&mut self, targets: &Grid) -> Result<()> {
        ensure_size("prediction target", self.hidden_size, targets.size())?;
        let tier = self.tier;
        let prev = self.hidden_states.front();

        for vl in &mut self.visible_layers {
            let rate = vl.desc.alpha;
            let field = &vl.field;
            let sources = vl.states.front();
            substrate::launch_columns(tier, vl.weights.data_mut(), field.slots(), |h, w| {
                let delta = targets.data()[h] - prev.data()[h];
                if delta == 0.0 {
                    return;
                }
                for s in field.forward(h) {
                    w[s.slot] += rate * delta * sources.data()[s.cell];
                }
            });
        }
        Ok(())
    }

    /// TD-modulated variant: traces accumulate the delta-rule term and
    /// `td_error` decides how much of it is committed. Sources without
    /// traces fall back to the plain delta rule.
    pub fn learn_trace(&mut self, targets: &Grid, td_error: f32, trace_decay: f32) -> Result<()> {
        ensure_size("prediction target", self.hidden_size, targets.size())?;
        let tier = self.tier;
        let prev = self.hidden_states.front();

        for vl in &mut self.visible_layers {
            let rate = vl.desc.alpha;
            let field = &vl.field;
            let sources = vl.states.front();
            let slots = field.slots();

            match &mut vl.traces {
                Some(traces) => substrate::launch_columns_pair(
                    tier,
                    vl.weights.data_mut(),
                    traces.data_mut(),
                    slots,
                    |h, w, e| {
                        let delta = targets.data()[h] - prev.data()[h];
                        for s in field.forward(h) {
                            e[s.slot] = trace_decay * e[s.slot] + delta * sources.data()[s.cell];
                            w[s.slot] += rate * td_error * e[s.slot];
                        }
                    },
                ),
                None => substrate::launch_columns(tier, vl.weights.data_mut(), slots, |h, w| {
                    let delta = targets.data()[h] - prev.data()[h];
                    for s in field.forward(h) {
                        w[s.slot] += rate * delta * sources.data()[s.cell];
                    }
                }),
            }
        }
        Ok(())
    }

    pub fn clear_state(&mut self) {
        self.hidden_summation.reset_with(|g| g.fill(0.0));
        self.hidden_states.reset_with(|g| g.fill(0.0));
        self.hidden_errors.fill(0.0);
        for vl in &mut self.visible_layers {
            vl.states.reset_with(|g| g.fill(0.0));
            vl.errors.fill(0.0);
            if let Some(t) = &mut vl.traces {
                t.fill(0.0);
            }
        }
    }

    /// Current prediction.
    pub fn prediction(&self) -> &Grid {
        self.hidden_states.back()
    }

    /// Prediction made by the activation before the last one.
    pub fn previous_prediction(&self) -> &Grid {
        self.hidden_states.front()
    }

    pub fn visible_errors(&self, i: usize) -> &Grid {
        &self.visible_layers[i].errors
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

    pub fn write_to_stream<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_grid_text(w, self.hidden_states.back())?;
        for vl in &self.visible_layers {
            storage::write_grid_text(w, &vl.weights)?;
        }
        Ok(())
    }

    pub fn read_from_stream<R: BufRead>(&mut self, r: &mut TokenReader<R>) -> Result<()> {
        r.read_grid(self.hidden_states.front_mut())?;
        self.hidden_states.swap();
        for vl in &mut self.visible_layers {
            r.read_grid(&mut vl.weights)?;
        }
        Ok(())
    }

    pub(crate) fn write_image(&self, buf: &mut Vec<u8>) {
        storage::push_grid(buf, self.hidden_states.back());
        for vl in &self.visible_layers {
            storage::push_grid(buf, &vl.weights);
        }
    }

    pub(crate) fn read_image(&mut self, r: &mut PayloadReader<'_>) -> Result<()> {
        r.read_grid(self.hidden_states.front_mut())?;
        self.hidden_states.swap();
        for vl in &mut self.visible_layers {
            r.read_grid(&mut vl.weights)?;
        }
        Ok(())
    }
}
