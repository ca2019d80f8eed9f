//! # predcoder
//!
//! Hierarchical sparse coding and predictive coding on locally connected 2D
//! grids.
//!
//! Each layer turns a window of its input into a sparse binary code through
//! local competition and predicts the next state of the layer below with a
//! locally connected linear predictor. All learning is local and online:
//! reconstruction residuals for the coders, prediction errors (optionally
//! reward-modulated through eligibility traces) for the predictors.
//!
//! ## Quick Start
//!
//! ```
//! use predcoder::prelude::*;
//!
//! let config = HierarchyConfig::new(Int2::new(4, 4), vec![LayerDesc::new(Int2::new(8, 8))]);
//! let mut hierarchy = Hierarchy::new(config, &mut Prng::new(42)).unwrap();
//!
//! let mut input = Grid::new(Int2::new(4, 4));
//! input.set(1, 1, 1.0);
//! hierarchy.step(&input, 0.0, true).unwrap();
//!
//! let next = hierarchy.prediction();
//! assert_eq!(next.size(), Int2::new(4, 4));
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): config (de)serialization and binary images
//! - `cli` (default): the `predcoder` demo binary
//! - `parallel`: per-cell launches on the rayon pool
//! - `simd`: dense element-wise passes via the `wide` crate
//!
//! ## Modules
//!
//! - [`hierarchy`]: layered orchestrator and its config
//! - [`sparse_coder`], [`comparison_sparse_coder`]: sparse coders
//! - [`predictor`], [`predictor_swarm`]: predictors and action selection
//! - [`agent`]: hierarchy + action selector
//! - [`observer`]: read-only snapshots

#[path = "core/error.rs"]
pub mod error;

#[path = "core/geometry.rs"]
pub mod geometry;

#[path = "core/grid.rs"]
pub mod grid;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/substrate.rs"]
pub mod substrate;

#[path = "core/visible.rs"]
pub mod visible;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/sparse_coder.rs"]
pub mod sparse_coder;

#[path = "core/comparison_sparse_coder.rs"]
pub mod comparison_sparse_coder;

#[path = "core/predictor.rs"]
pub mod predictor;

#[path = "core/predictor_swarm.rs"]
pub mod predictor_swarm;

#[path = "core/hierarchy.rs"]
pub mod hierarchy;

#[path = "core/agent.rs"]
pub mod agent;

pub mod observer;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
///
/// ```
/// use predcoder::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{Agent, SwarmParams};
    pub use crate::comparison_sparse_coder::ComparisonSparseCoder;
    pub use crate::error::{Error, Result};
    pub use crate::geometry::{Int2, ReceptiveField};
    pub use crate::grid::{DoubleBuffer, Grid};
    pub use crate::hierarchy::{
        Hierarchy, HierarchyConfig, HierarchyDiagnostics, LayerDesc, LayerDiagnostics,
    };
    pub use crate::predictor::Predictor;
    pub use crate::predictor_swarm::PredictorSwarm;
    pub use crate::prng::{Prng, RandomSource};
    pub use crate::sparse_coder::{SparseCoder, UnitState};
    pub use crate::substrate::ExecutionTier;
    pub use crate::visible::VisibleLayerDesc;
}
