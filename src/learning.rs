// Sparse clockwork hierarchy - learning rules and runtime layer parameters

use serde::{Deserialize, Serialize};

use crate::helpers::squash;

/// Update rule for feed-forward (encode) weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeRule {
    /// Delta rule against the squashed, count-normalized reconstruction.
    #[default]
    Delta,
    /// Plain Hebbian decay toward the target.
    Hebbian,
}

impl EncodeRule {
    /// Weight change for one connection of the previous winner.
    #[inline]
    pub fn delta(self, rate: f32, target: f32, weight: f32, recon_sum: f32, recon_count: f32) -> f32 {
        match self {
            EncodeRule::Delta => rate * (target - squash(recon_sum / recon_count.max(1.0))),
            EncodeRule::Hebbian => rate * (target - weight),
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EncodeRule::Delta => 0,
            EncodeRule::Hebbian => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EncodeRule::Delta),
            1 => Some(EncodeRule::Hebbian),
            _ => None,
        }
    }
}

/// Update rule for feed-back (predict) weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictRule {
    /// One-tick-delayed delta rule against the squashed previous activation.
    #[default]
    Delta,
    Hebbian,
    /// Reward-driven: activations are Q-values, selection is epsilon-greedy
    /// and weights follow the TD error through eligibility traces.
    TemporalDifference,
}

impl PredictRule {
    /// Weight change for one supervised connection (not used by TD).
    #[inline]
    pub fn delta(self, rate: f32, target: f32, weight: f32, activation_prev: f32) -> f32 {
        match self {
            PredictRule::Hebbian => rate * (target - weight),
            _ => rate * (target - squash(activation_prev)),
        }
    }

    pub fn is_reward_driven(self) -> bool {
        self == PredictRule::TemporalDifference
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            PredictRule::Delta => 0,
            PredictRule::Hebbian => 1,
            PredictRule::TemporalDifference => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PredictRule::Delta),
            1 => Some(PredictRule::Hebbian),
            2 => Some(PredictRule::TemporalDifference),
            _ => None,
        }
    }
}

/// Parameters of the reward-driven predict rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TdParams {
    /// Discount factor.
    pub gamma: f32,
    /// Trace decay; traces shrink by `gamma * lambda` each tick.
    pub lambda: f32,
    /// Exploration rate for epsilon-greedy selection.
    pub epsilon: f32,
    /// Traces below this magnitude are zeroed.
    pub trace_cutoff: f32,
    /// Replay buffer capacity (oldest sample evicted first).
    pub max_replay_samples: usize,
    /// Replayed samples per tick.
    pub replay_iters: usize,
}

impl Default for TdParams {
    fn default() -> Self {
        Self {
            gamma: 0.95,
            lambda: 0.95,
            epsilon: 0.02,
            trace_cutoff: 0.001,
            max_replay_samples: 100,
            replay_iters: 4,
        }
    }
}

/// Runtime hyperparameters for one layer.
///
/// May be adjusted between [`Hierarchy::step`](crate::hierarchy::Hierarchy::step) calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerParams {
    /// Feed-forward learning rate.
    pub alpha: f32,
    /// Feed-back learning rate.
    pub beta: f32,
    pub encode_rule: EncodeRule,
    pub predict_rule: PredictRule,
    pub td: TdParams,
}

impl Default for LayerParams {
    fn default() -> Self {
        Self {
            alpha: 0.4,
            beta: 0.4,
            encode_rule: EncodeRule::Delta,
            predict_rule: PredictRule::Delta,
            td: TdParams::default(),
        }
    }
}
