//! Reinforcement-learning wrapper: a [`PredictorSwarm`] reading the bottom
//! code of a [`Hierarchy`] and emitting spiking actions.

use std::io::{BufRead, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::geometry::Int2;
use crate::grid::Grid;
use crate::hierarchy::{Hierarchy, HierarchyConfig};
use crate::predictor_swarm::PredictorSwarm;
use crate::prng::RandomSource;
use crate::visible::VisibleLayerDesc;

/// Action-selector parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SwarmParams {
    /// Window onto the layer-0 code.
    pub radius: i32,
    pub alpha: f32,
    pub trace_decay: f32,
    /// Exploration noise amplitude.
    pub noise: f32,
    pub leak: f32,
    pub init_weight_range: (f32, f32),
}

impl Default for SwarmParams {
    fn default() -> Self {
        Self {
            radius: 2,
            alpha: 0.1,
            trace_decay: 0.9,
            noise: 0.2,
            leak: 0.1,
            init_weight_range: (-0.05, 0.05),
        }
    }
}

impl SwarmParams {
    pub fn with_noise(mut self, noise: f32, leak: f32) -> Self {
        self.noise = noise;
        self.leak = leak;
        self
    }

    pub fn with_learning(mut self, alpha: f32, trace_decay: f32) -> Self {
        self.alpha = alpha;
        self.trace_decay = trace_decay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.radius < 0 {
            return Err(Error::InvalidConfig("swarm radius must be >= 0"));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(Error::InvalidConfig("swarm alpha must be finite and >= 0"));
        }
        if !(0.0..=1.0).contains(&self.trace_decay) || !(0.0..=1.0).contains(&self.leak) {
            return Err(Error::InvalidConfig("swarm trace_decay and leak must be in [0, 1]"));
        }
        if !self.noise.is_finite() || self.noise < 0.0 {
            return Err(Error::InvalidConfig("swarm noise must be finite and >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    hierarchy: Hierarchy,
    swarm: PredictorSwarm,
    params: SwarmParams,
}

impl Agent {
    pub fn new(
        config: HierarchyConfig,
        action_size: Int2,
        params: SwarmParams,
        rng: &mut impl RandomSource,
    ) -> Result<Self> {
        params.validate()?;
        let tier = config.tier;
        let hierarchy = Hierarchy::new(config, rng)?;

        let code_size = hierarchy.layer_code(0).size();
        let mut swarm = PredictorSwarm::create_random(
            action_size,
            vec![VisibleLayerDesc::new(code_size, params.radius)],
            params.init_weight_range,
            rng,
        )?;
        swarm.set_execution_tier(tier);

        debug!(actions = ?action_size, "built agent");
        Ok(Self {
            hierarchy,
            swarm,
            params,
        })
    }

    /// Step the hierarchy, credit the previous action with `reward`, then
    /// pick the next action.
    pub fn step(
        &mut self,
        input: &Grid,
        reward: f32,
        rng: &mut impl RandomSource,
        learn: bool,
    ) -> Result<()> {
        self.hierarchy.step(input, reward, learn)?;
        if learn {
            self.swarm
                .learn(reward, self.params.alpha, self.params.trace_decay);
        }
        let code = self.hierarchy.layer_code(0);
        self.swarm
            .activate(&[code], self.params.noise, self.params.leak, rng)
    }

    /// Spike pattern of the last step.
    pub fn actions(&self) -> &Grid {
        self.swarm.hidden_states()
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn swarm(&self) -> &PredictorSwarm {
        &self.swarm
    }

    pub fn clear_state(&mut self) {
        self.hierarchy.clear_state();
        self.swarm.clear_state();
    }

    pub fn write_to_stream<W: Write>(&self, _w: &mut W) -> Result<()> {
        Err(Error::UnsupportedOperation("agent persistence"))
    }

    pub fn read_from_stream<R: BufRead>(&mut self, _r: R) -> Result<()> {
        Err(Error::UnsupportedOperation("agent persistence"))
    }
}
