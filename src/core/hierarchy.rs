//! Layered predictive-coding hierarchy.
//!
//! Every layer owns a [`ComparisonSparseCoder`] that encodes the layer below
//! (or the raw input) and a [`Predictor`] that predicts what the layer below
//! will look like on the next step. Learning is strictly local: each layer
//! only uses its own errors and the previous step's state of its neighbors.

use std::io::{BufRead, Write};
#[cfg(feature = "serde")]
use std::io::Read;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::comparison_sparse_coder::ComparisonSparseCoder;
use crate::error::{ensure_size, Error, Result};
use crate::geometry::Int2;
use crate::grid::{DoubleBuffer, Grid};
use crate::predictor::Predictor;
use crate::prng::RandomSource;
use crate::storage::TokenReader;
#[cfg(feature = "serde")]
use crate::storage::{self, PayloadReader};
use crate::substrate::{self, ExecutionTier};
use crate::visible::VisibleLayerDesc;

/// Shape and learning parameters of one hierarchy level.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LayerDesc {
    pub hidden_size: Int2,

    /// Feed-forward window onto the layer below.
    pub coder_radius: i32,
    /// Competition neighborhood.
    pub lateral_radius: i32,
    /// Window of the coder onto its own previous code. `None` drops the
    /// recurrent source.
    pub recurrent_radius: Option<i32>,
    /// Window of the predictor onto this layer's code (and the prediction
    /// coming down from the layer above).
    pub predictor_radius: i32,

    pub active_ratio: f32,
    pub coder_alpha: f32,
    pub coder_bias_alpha: f32,
    pub predictor_alpha: f32,

    /// EMA rate of the per-unit error baseline.
    pub baseline_decay: f32,

    // Reward modulation (only with `use_traces`).
    pub gamma: f32,
    pub lambda: f32,
    pub use_traces: bool,
}

impl Default for LayerDesc {
    fn default() -> Self {
        Self {
            hidden_size: Int2::new(8, 8),
            coder_radius: 2,
            lateral_radius: 1,
            recurrent_radius: Some(1),
            predictor_radius: 2,
            active_ratio: 0.2,
            coder_alpha: 0.01,
            coder_bias_alpha: 0.001,
            predictor_alpha: 0.05,
            baseline_decay: 0.01,
            gamma: 0.9,
            lambda: 0.9,
            use_traces: false,
        }
    }
}

impl LayerDesc {
    pub fn new(hidden_size: Int2) -> Self {
        Self {
            hidden_size,
            ..Default::default()
        }
    }

    pub fn with_radii(mut self, coder: i32, lateral: i32, predictor: i32) -> Self {
        self.coder_radius = coder;
        self.lateral_radius = lateral;
        self.predictor_radius = predictor;
        self
    }

    pub fn with_recurrence(mut self, radius: i32) -> Self {
        self.recurrent_radius = Some(radius);
        self
    }

    /// Code from the layer below only.
    pub fn without_recurrence(mut self) -> Self {
        self.recurrent_radius = None;
        self
    }

    pub fn with_active_ratio(mut self, ratio: f32) -> Self {
        self.active_ratio = ratio;
        self
    }

    /// Set the coder weight/bias rates and the predictor rate.
    pub fn with_rates(mut self, coder: f32, coder_bias: f32, predictor: f32) -> Self {
        self.coder_alpha = coder;
        self.coder_bias_alpha = coder_bias;
        self.predictor_alpha = predictor;
        self
    }

    /// Enable reward-modulated learning with discount `gamma` and trace
    /// parameter `lambda`.
    pub fn with_traces(mut self, gamma: f32, lambda: f32) -> Self {
        self.use_traces = true;
        self.gamma = gamma;
        self.lambda = lambda;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &'static str| Err(Error::InvalidConfig(msg));

        if self.hidden_size.x <= 0 || self.hidden_size.y <= 0 {
            return invalid("layer hidden_size must be positive");
        }
        if self.coder_radius < 0 || self.predictor_radius < 0 {
            return invalid("coder_radius and predictor_radius must be >= 0");
        }
        if self.lateral_radius < 1 {
            return invalid("lateral_radius must be >= 1");
        }
        if matches!(self.recurrent_radius, Some(r) if r < 1) {
            return invalid("recurrent_radius must be >= 1");
        }
        if !(self.active_ratio > 0.0 && self.active_ratio <= 1.0) {
            return invalid("active_ratio must be in (0, 1]");
        }
        for rate in [self.coder_alpha, self.coder_bias_alpha, self.predictor_alpha] {
            if !rate.is_finite() || rate < 0.0 {
                return invalid("learning rates must be finite and >= 0");
            }
        }
        if !(0.0..=1.0).contains(&self.baseline_decay) {
            return invalid("baseline_decay must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.gamma) || !(0.0..=1.0).contains(&self.lambda) {
            return invalid("gamma and lambda must be in [0, 1]");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HierarchyConfig {
    pub input_size: Int2,
    /// Bottom to top.
    pub layers: Vec<LayerDesc>,
    pub init_weight_range: (f32, f32),
    /// EMA rate of the scalar reward baseline used for TD errors.
    pub reward_baseline_decay: f32,
    /// Binarise the input prediction (layer 0). Upper layers always predict
    /// binary codes.
    pub binarize_input_prediction: bool,
    pub tier: ExecutionTier,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            input_size: Int2::new(4, 4),
            layers: vec![LayerDesc::default()],
            init_weight_range: (-0.05, 0.05),
            reward_baseline_decay: 0.01,
            binarize_input_prediction: false,
            tier: ExecutionTier::Scalar,
        }
    }
}

impl HierarchyConfig {
    pub fn new(input_size: Int2, layers: Vec<LayerDesc>) -> Self {
        Self {
            input_size,
            layers,
            ..Default::default()
        }
    }

    pub fn with_init_weight_range(mut self, low: f32, high: f32) -> Self {
        self.init_weight_range = (low, high);
        self
    }

    pub fn with_tier(mut self, tier: ExecutionTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_binarized_input_prediction(mut self, binarize: bool) -> Self {
        self.binarize_input_prediction = binarize;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.input_size.x <= 0 || self.input_size.y <= 0 {
            return Err(Error::InvalidConfig("input_size must be positive"));
        }
        if self.layers.is_empty() {
            return Err(Error::InvalidConfig("at least one layer is required"));
        }
        for layer in &self.layers {
            layer.validate()?;
        }
        let (low, high) = self.init_weight_range;
        if !(low.is_finite() && high.is_finite() && low <= high) {
            return Err(Error::InvalidConfig(
                "init_weight_range must be finite with low <= high",
            ));
        }
        if !(0.0..=1.0).contains(&self.reward_baseline_decay) {
            return Err(Error::InvalidConfig("reward_baseline_decay must be in [0, 1]"));
        }
        Ok(())
    }

    /// Parse and validate a JSON config. Missing fields take their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: HierarchyConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LayerDiagnostics {
    pub hidden_size: Int2,
    /// Fraction of active code units.
    pub code_density: f32,
    pub mean_reward: f32,
    pub mean_baseline: f32,
    pub prediction_error: f32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct HierarchyDiagnostics {
    pub steps: u64,
    pub reward_baseline: f32,
    pub layers: Vec<LayerDiagnostics>,
}

#[derive(Debug, Clone)]
struct Layer {
    desc: LayerDesc,
    coder: ComparisonSparseCoder,
    predictor: Predictor,
    code_prev: Grid,
    /// Per-unit error baselines.
    baselines: DoubleBuffer<Grid>,
    signal: Grid,
    rewards: Grid,
    prediction_error: f32,
}

impl Layer {
    /// `s = predictor error on this code + coder hidden error`, then the
    /// reward is `s` against the running baseline.
    fn update_rewards(&mut self, tier: ExecutionTier) {
        let predicted = self.predictor.visible_errors(0);
        let explained = self.coder.hidden_errors();
        substrate::launch(tier, self.signal.data_mut(), |h| {
            predicted.data()[h] + explained.data()[h]
        });

        let beta = self.desc.baseline_decay;
        let signal = &self.signal;
        let (front, back) = self.baselines.split();
        substrate::launch_pair(tier, front.data_mut(), self.rewards.data_mut(), |h| {
            let s = signal.data()[h];
            let b = back.data()[h];
            ((1.0 - beta) * b + beta * s, s - b)
        });
    }
}

#[derive(Debug, Clone)]
pub struct Hierarchy {
    config: HierarchyConfig,
    layers: Vec<Layer>,
    reward_baseline: f32,
    steps: u64,
}

impl Hierarchy {
    pub fn new(config: HierarchyConfig, rng: &mut impl RandomSource) -> Result<Self> {
        config.validate()?;

        let num_layers = config.layers.len();
        let mut layers = Vec::with_capacity(num_layers);
        for (l, desc) in config.layers.iter().enumerate() {
            let below_size = if l == 0 {
                config.input_size
            } else {
                config.layers[l - 1].hidden_size
            };

            let neighbors = ((2 * desc.lateral_radius + 1).pow(2) - 1) as f32;
            if desc.active_ratio * neighbors < 1.0 {
                warn!(
                    layer = l,
                    active_ratio = desc.active_ratio,
                    lateral_radius = desc.lateral_radius,
                    "active ratio admits only local maxima"
                );
            }

            let mut coder_descs = vec![VisibleLayerDesc::new(below_size, desc.coder_radius)
                .with_trace(desc.use_traces)];
            if let Some(r) = desc.recurrent_radius {
                coder_descs.push(
                    VisibleLayerDesc::new(desc.hidden_size, r)
                        .with_ignore_middle(true)
                        .with_trace(desc.use_traces),
                );
            }
            let mut coder = ComparisonSparseCoder::create_random(
                desc.hidden_size,
                coder_descs,
                desc.lateral_radius,
                config.init_weight_range,
                rng,
            )?;
            coder.set_execution_tier(config.tier);

            let own = VisibleLayerDesc::new(desc.hidden_size, desc.predictor_radius)
                .with_alpha(desc.predictor_alpha)
                .with_trace(desc.use_traces);
            let mut predictor_descs = vec![own];
            if l + 1 < num_layers {
                // The layer above predicts this layer's code.
                predictor_descs.push(own);
            }
            let mut predictor =
                Predictor::create_random(below_size, predictor_descs, config.init_weight_range, rng)?;
            predictor.set_execution_tier(config.tier);

            let zeros = Grid::new(desc.hidden_size);
            layers.push(Layer {
                desc: *desc,
                coder,
                predictor,
                code_prev: zeros.clone(),
                baselines: DoubleBuffer::splat(zeros.clone()),
                signal: zeros.clone(),
                rewards: zeros,
                prediction_error: 0.0,
            });
        }

        debug!(
            layers = num_layers,
            input = ?config.input_size,
            tier = ?config.tier.effective(),
            "built hierarchy"
        );

        Ok(Self {
            config,
            layers,
            reward_baseline: 0.0,
            steps: 0,
        })
    }

    /// One external time step: bottom-up coding, top-down prediction,
    /// optional learning, then buffer rotation.
    pub fn step(&mut self, input: &Grid, reward: f32, learn: bool) -> Result<()> {
        ensure_size("hierarchy input", self.config.input_size, input.size())?;
        let tier = self.config.tier;
        let binarize_input = self.config.binarize_input_prediction;
        let n = self.layers.len();

        // Bottom-up.
        for l in 0..n {
            let (below, rest) = self.layers.split_at_mut(l);
            let layer = &mut rest[0];
            let bottom = below.last().map_or(input, |b| b.coder.hidden_states());

            let mut sources = vec![bottom];
            if layer.desc.recurrent_radius.is_some() {
                sources.push(&layer.code_prev);
            }
            layer.coder.activate(&sources, layer.desc.active_ratio)?;
            layer.update_rewards(tier);
        }

        // Top-down.
        for l in (0..n).rev() {
            let (lower, upper) = self.layers.split_at_mut(l + 1);
            let (below, current) = lower.split_at_mut(l);
            let layer = &mut current[0];
            let target = below.last().map_or(input, |b| b.coder.hidden_states());

            let mut sources = vec![layer.coder.hidden_states()];
            if let Some(above) = upper.first() {
                sources.push(above.predictor.prediction());
            }
            layer.predictor.activate(&sources, l > 0 || binarize_input)?;
            layer.predictor.propagate_error(target)?;
            layer.prediction_error = target.mean_squared_error(layer.predictor.previous_prediction());
        }

        if learn {
            let td_error = reward - self.reward_baseline;
            for l in (0..n).rev() {
                let (below, current) = self.layers.split_at_mut(l);
                let layer = &mut current[0];
                let target = below.last().map_or(input, |b| b.coder.hidden_states());
                let d = layer.desc;

                if d.use_traces {
                    let decay = d.gamma * d.lambda;
                    layer.predictor.learn_trace(target, td_error, decay)?;
                    layer.coder.learn_trace(
                        &layer.rewards,
                        d.coder_alpha,
                        decay,
                        d.coder_bias_alpha,
                        d.active_ratio,
                    )?;
                } else {
                    layer.predictor.learn(target)?;
                    layer.coder.learn(d.coder_alpha, d.coder_bias_alpha, d.active_ratio);
                }
            }
        }

        for layer in &mut self.layers {
            layer.code_prev.copy_from(layer.coder.hidden_states());
            layer.baselines.swap();
        }
        self.reward_baseline += self.config.reward_baseline_decay * (reward - self.reward_baseline);
        self.steps += 1;

        trace!(
            step = self.steps,
            prediction_error = self.layers[0].prediction_error,
            reward_baseline = self.reward_baseline,
            "hierarchy step"
        );
        Ok(())
    }

    /// Prediction of the next input.
    pub fn prediction(&self) -> &Grid {
        self.layers[0].predictor.prediction()
    }

    pub fn layer_code(&self, l: usize) -> &Grid {
        self.layers[l].coder.hidden_states()
    }

    /// Per-unit reward signal computed for layer `l` on the last step.
    pub fn layer_rewards(&self, l: usize) -> &Grid {
        &self.layers[l].rewards
    }

    /// MSE between what layer `l` predicted on the previous step and what
    /// actually arrived below it on the last one.
    pub fn prediction_error(&self, l: usize) -> f32 {
        self.layers[l].prediction_error
    }

    pub fn coder(&self, l: usize) -> &ComparisonSparseCoder {
        &self.layers[l].coder
    }

    pub fn predictor(&self, l: usize) -> &Predictor {
        &self.layers[l].predictor
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn reward_baseline(&self) -> f32 {
        self.reward_baseline
    }

    /// Drop all transient state. Learned parameters are kept.
    pub fn clear_state(&mut self) {
        for layer in &mut self.layers {
            layer.coder.clear_state();
            layer.predictor.clear_state();
            layer.code_prev.fill(0.0);
            layer.baselines.reset_with(|g| g.fill(0.0));
            layer.signal.fill(0.0);
            layer.rewards.fill(0.0);
            layer.prediction_error = 0.0;
        }
        self.reward_baseline = 0.0;
    }

    pub fn diagnostics(&self) -> HierarchyDiagnostics {
        HierarchyDiagnostics {
            steps: self.steps,
            reward_baseline: self.reward_baseline,
            layers: self
                .layers
                .iter()
                .map(|layer| LayerDiagnostics {
                    hidden_size: layer.desc.hidden_size,
                    code_density: layer.coder.hidden_states().mean(),
                    mean_reward: layer.rewards.mean(),
                    mean_baseline: layer.baselines.back().mean(),
                    prediction_error: layer.prediction_error,
                })
                .collect(),
        }
    }

    /// Plain-text dump, layer by layer: coder, predictor, previous code.
    pub fn write_to_stream<W: Write>(&self, w: &mut W) -> Result<()> {
        for layer in &self.layers {
            layer.coder.write_to_stream(w)?;
            layer.predictor.write_to_stream(w)?;
            crate::storage::write_grid_text(w, &layer.code_prev)?;
        }
        Ok(())
    }

    /// Inverse of [`write_to_stream`](Self::write_to_stream). `self` must
    /// have been built from the same config as the writer.
    pub fn read_from_stream<R: BufRead>(&mut self, r: R) -> Result<()> {
        let mut reader = TokenReader::new(r);
        for layer in &mut self.layers {
            layer.coder.read_from_stream(&mut reader)?;
            layer.predictor.read_from_stream(&mut reader)?;
            reader.read_grid(&mut layer.code_prev)?;
        }
        Ok(())
    }

    /// Binary image: config as JSON, then one LZ4 chunk per layer.
    #[cfg(feature = "serde")]
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> Result<()> {
        storage::write_header(w)?;
        storage::write_chunk_lz4(w, storage::TAG_CONFIG, &serde_json::to_vec(&self.config)?)?;
        for layer in &self.layers {
            let mut payload = Vec::new();
            layer.coder.write_image(&mut payload);
            layer.predictor.write_image(&mut payload);
            storage::push_grid(&mut payload, &layer.code_prev);
            storage::write_chunk_lz4(w, storage::TAG_LAYER, &payload)?;
        }
        storage::write_chunk_lz4(w, storage::TAG_END, &[])?;
        Ok(())
    }

    /// Rebuild a hierarchy from an image written by
    /// [`save_image_to`](Self::save_image_to).
    #[cfg(feature = "serde")]
    pub fn load_image_from<R: Read>(r: &mut R) -> Result<Self> {
        storage::read_header(r)?;

        let (tag, payload) = storage::read_chunk_lz4(r)?;
        if tag != storage::TAG_CONFIG {
            return Err(Error::Parse("image does not start with a config chunk".to_string()));
        }
        let config: HierarchyConfig = serde_json::from_slice(&payload)?;

        // Every parameter is overwritten below; the seed is irrelevant.
        let mut hierarchy = Self::new(config, &mut crate::prng::Prng::new(1))?;
        for (l, layer) in hierarchy.layers.iter_mut().enumerate() {
            let (tag, payload) = storage::read_chunk_lz4(r)?;
            if tag != storage::TAG_LAYER {
                return Err(Error::Parse(format!("missing chunk for layer {l}")));
            }
            let mut reader = PayloadReader::new(&payload);
            layer.coder.read_image(&mut reader)?;
            layer.predictor.read_image(&mut reader)?;
            reader.read_grid(&mut layer.code_prev)?;
            if !reader.is_exhausted() {
                return Err(Error::Parse(format!("trailing bytes in layer {l} chunk")));
            }
        }

        let (tag, _) = storage::read_chunk_lz4(r)?;
        if tag != storage::TAG_END {
            return Err(Error::Parse("missing end chunk".to_string()));
        }
        debug!(layers = hierarchy.layers.len(), "loaded hierarchy image");
        Ok(hierarchy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    const CYCLE: [usize; 4] = [0, 5, 10, 15];

    fn one_hot(cell: usize) -> Grid {
        let mut g = Grid::new(Int2::new(4, 4));
        g.data_mut()[cell] = 1.0;
        g
    }

    fn two_layer_config() -> HierarchyConfig {
        HierarchyConfig::new(
            Int2::new(4, 4),
            vec![
                LayerDesc::new(Int2::new(8, 8)),
                LayerDesc::new(Int2::new(4, 4)).with_radii(2, 1, 2),
            ],
        )
    }

    #[test]
    fn learns_to_predict_a_cycle() {
        let config = HierarchyConfig::new(
            Int2::new(4, 4),
            vec![LayerDesc::new(Int2::new(8, 8)).with_rates(0.01, 0.001, 0.05)],
        );
        let mut h = Hierarchy::new(config, &mut Prng::new(42)).unwrap();

        let mut errors = Vec::with_capacity(1000);
        for step in 0..1000 {
            h.step(&one_hot(CYCLE[step % 4]), 0.0, true).unwrap();
            errors.push(h.prediction_error(0));
        }

        let initial: f32 = errors[..4].iter().sum::<f32>() / 4.0;
        let last: f32 = errors[900..].iter().sum::<f32>() / 100.0;
        assert!(last < 0.5 * initial, "initial={initial} last={last}");
    }

    #[test]
    fn coders_see_their_previous_code_by_default() {
        let h = Hierarchy::new(two_layer_config(), &mut Prng::new(2)).unwrap();
        for l in 0..h.num_layers() {
            assert_eq!(h.coder(l).num_visible_layers(), 2);
            let own = h.coder(l).visible_layer_desc(1);
            assert_eq!(own.size, h.layer_code(l).size());
            assert!(own.ignore_middle);
        }

        let flat = HierarchyConfig::new(
            Int2::new(4, 4),
            vec![LayerDesc::new(Int2::new(8, 8)).without_recurrence()],
        );
        let h = Hierarchy::new(flat, &mut Prng::new(2)).unwrap();
        assert_eq!(h.coder(0).num_visible_layers(), 1);
    }

    #[test]
    fn codes_are_sparse_and_binary() {
        let mut h = Hierarchy::new(two_layer_config(), &mut Prng::new(1)).unwrap();
        for step in 0..20 {
            h.step(&one_hot(CYCLE[step % 4]), 0.0, true).unwrap();
        }
        for l in 0..h.num_layers() {
            let code = h.layer_code(l);
            assert!(code.data().iter().all(|&v| v == 0.0 || v == 1.0));
            let density = code.mean();
            assert!(density > 0.0 && density < 0.6, "layer {l} density {density}");
        }
        // Upper layers predict binary codes.
        assert!(h
            .predictor(1)
            .prediction()
            .data()
            .iter()
            .all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn reward_modulated_layers_step() {
        let config = HierarchyConfig::new(
            Int2::new(4, 4),
            vec![
                LayerDesc::new(Int2::new(6, 6)).with_traces(0.9, 0.8),
                LayerDesc::new(Int2::new(4, 4)).with_traces(0.9, 0.8),
            ],
        );
        let mut h = Hierarchy::new(config, &mut Prng::new(3)).unwrap();
        for step in 0..50 {
            let reward = if step % 2 == 0 { 1.0 } else { -0.5 };
            h.step(&one_hot(CYCLE[step % 4]), reward, true).unwrap();
        }
        let diag = h.diagnostics();
        assert_eq!(diag.steps, 50);
        assert_eq!(diag.layers.len(), 2);
        assert!(diag.layers.iter().all(|l| l.mean_reward.is_finite()));
        assert!(h.prediction().data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn text_stream_roundtrip_reproduces_outputs() {
        let mut trained = Hierarchy::new(two_layer_config(), &mut Prng::new(7)).unwrap();
        for step in 0..30 {
            trained.step(&one_hot(CYCLE[step % 4]), 0.0, true).unwrap();
        }

        let mut text = Vec::new();
        trained.write_to_stream(&mut text).unwrap();
        let mut restored = Hierarchy::new(two_layer_config(), &mut Prng::new(8)).unwrap();
        restored.read_from_stream(text.as_slice()).unwrap();

        for step in 0..4 {
            let input = one_hot(CYCLE[step]);
            trained.step(&input, 0.0, false).unwrap();
            restored.step(&input, 0.0, false).unwrap();
            assert_eq!(trained.layer_code(0), restored.layer_code(0));
            assert_eq!(trained.layer_code(1), restored.layer_code(1));
            assert_eq!(trained.prediction(), restored.prediction());
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn binary_image_roundtrip_reproduces_outputs() {
        let mut trained = Hierarchy::new(two_layer_config(), &mut Prng::new(9)).unwrap();
        for step in 0..30 {
            trained.step(&one_hot(CYCLE[step % 4]), 0.0, true).unwrap();
        }

        let mut image = Vec::new();
        trained.save_image_to(&mut image).unwrap();
        let mut restored = Hierarchy::load_image_from(&mut image.as_slice()).unwrap();
        assert_eq!(restored.config(), trained.config());

        let input = one_hot(CYCLE[2]);
        trained.step(&input, 0.0, false).unwrap();
        restored.step(&input, 0.0, false).unwrap();
        assert_eq!(trained.layer_code(0), restored.layer_code(0));
        assert_eq!(trained.prediction(), restored.prediction());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let trained = Hierarchy::new(two_layer_config(), &mut Prng::new(7)).unwrap();
        let mut text = Vec::new();
        trained.write_to_stream(&mut text).unwrap();
        text.truncate(text.len() / 2);

        let mut restored = Hierarchy::new(two_layer_config(), &mut Prng::new(8)).unwrap();
        assert!(restored.read_from_stream(text.as_slice()).is_err());
    }

    #[test]
    fn clear_state_keeps_learned_parameters() {
        let mut h = Hierarchy::new(two_layer_config(), &mut Prng::new(11)).unwrap();
        for step in 0..10 {
            h.step(&one_hot(CYCLE[step % 4]), 1.0, true).unwrap();
        }
        let weights = h.predictor(0).weights(0).clone();
        h.clear_state();
        assert_eq!(h.predictor(0).weights(0), &weights);
        assert!(h.layer_code(0).data().iter().all(|&v| v == 0.0));
        assert_eq!(h.reward_baseline(), 0.0);
    }

    #[test]
    fn rejects_wrong_input_size() {
        let mut h = Hierarchy::new(HierarchyConfig::default(), &mut Prng::new(1)).unwrap();
        let wrong = Grid::new(Int2::new(3, 3));
        assert!(matches!(
            h.step(&wrong, 0.0, true),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn validation_catches_bad_configs() {
        assert!(HierarchyConfig::default().validate().is_ok());

        let empty = HierarchyConfig::new(Int2::new(4, 4), vec![]);
        assert!(matches!(empty.validate(), Err(Error::InvalidConfig(_))));

        let bad_ratio = HierarchyConfig::new(
            Int2::new(4, 4),
            vec![LayerDesc::default().with_active_ratio(0.0)],
        );
        assert!(bad_ratio.validate().is_err());

        let no_neighbors =
            HierarchyConfig::new(Int2::new(4, 4), vec![LayerDesc::default().with_radii(2, 0, 2)]);
        assert!(no_neighbors.validate().is_err());

        let bad_range = HierarchyConfig::default().with_init_weight_range(1.0, -1.0);
        assert!(bad_range.validate().is_err());
        assert!(Hierarchy::new(bad_range, &mut Prng::new(1)).is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_config_fills_defaults() {
        let config = HierarchyConfig::from_json_str(
            r#"{ "input_size": { "x": 6, "y": 6 },
                 "layers": [ { "hidden_size": { "x": 10, "y": 10 }, "recurrent_radius": 2 } ] }"#,
        )
        .unwrap();
        assert_eq!(config.input_size, Int2::new(6, 6));
        assert_eq!(config.layers[0].recurrent_radius, Some(2));
        assert_eq!(config.layers[0].coder_radius, LayerDesc::default().coder_radius);

        let flat = HierarchyConfig::from_json_str(
            r#"{ "layers": [ { "recurrent_radius": null }, {} ] }"#,
        )
        .unwrap();
        assert_eq!(flat.layers[0].recurrent_radius, None);
        assert_eq!(flat.layers[1].recurrent_radius, Some(1));

        assert!(HierarchyConfig::from_json_str(r#"{ "layers": [] }"#).is_err());
    }
}
