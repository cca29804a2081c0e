// Sparse clockwork hierarchy
//
// Online-learning sparse predictive hierarchy. Each layer is a grid of
// competitive columns (one active cell per column) that encodes its inputs
// bottom-up and predicts them top-down. Higher layers tick at lower rates
// and see a temporal history of the layer below.

pub mod compute_system;
pub mod config;
pub mod error;
pub mod helpers;
pub mod hierarchy;
pub mod layer;
pub mod learning;
pub mod projection;
pub mod task_pool;

pub use compute_system::ComputeSystem;
pub use config::HierarchyConfig;
pub use error::{Error, Result};
pub use helpers::Int2;
pub use hierarchy::{Hierarchy, InputDesc, LayerDesc, Params};
pub use layer::{Layer, VisibleLayerDesc};
pub use learning::{EncodeRule, LayerParams, PredictRule, TdParams};
pub use task_pool::TaskPool;
