// Sparse clockwork hierarchy - JSON configuration
//
// A complete hierarchy setup in one serde document:
//
// {
//   "seed": 1,
//   "inputs": [{ "size": { "x": 8, "y": 8 }, "column_size": 8 }],
//   "layers": [{}, {}],
//   "params": [{ "alpha": 0.2 }, {}]
// }
//
// Missing fields take their defaults. `params` may be empty (defaults for
// every layer) or list one entry per layer.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hierarchy::{Hierarchy, InputDesc, LayerDesc, Params};
use crate::learning::LayerParams;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    pub inputs: Vec<InputDesc>,
    pub layers: Vec<LayerDesc>,
    pub params: Vec<LayerParams>,
    pub seed: u64,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            inputs: vec![InputDesc::default()],
            layers: vec![LayerDesc::default(); 3],
            params: Vec::new(),
            seed: 0,
        }
    }
}

impl HierarchyConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        log::info!("reading hierarchy config from {}", path.display());

        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Create the hierarchy this configuration describes.
    pub fn build(&self) -> Result<Hierarchy> {
        if !self.params.is_empty() && self.params.len() != self.layers.len() {
            return Err(Error::InvalidConfig(format!(
                "{} params entries for {} layers",
                self.params.len(),
                self.layers.len()
            )));
        }

        let mut h = Hierarchy::create(&self.layers, &self.inputs, self.seed)?;

        if !self.params.is_empty() {
            h.params = Params {
                layers: self.params.clone(),
            };
        }

        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::PredictRule;

    #[test]
    fn empty_document_uses_defaults() {
        let config = HierarchyConfig::from_json("{}").unwrap();
        assert_eq!(config, HierarchyConfig::default());

        let h = config.build().unwrap();
        assert_eq!(h.get_num_layers(), 3);
        assert_eq!(h.get_num_inputs(), 1);
    }

    #[test]
    fn params_are_applied_per_layer() {
        let config = HierarchyConfig::from_json(
            r#"{
                "layers": [{ "ticks_per_update": 1, "temporal_horizon": 1 }, {}],
                "params": [{ "alpha": 0.1 }, { "predict_rule": "hebbian" }]
            }"#,
        )
        .unwrap();

        let h = config.build().unwrap();
        assert_eq!(h.params.layers[0].alpha, 0.1);
        assert_eq!(h.params.layers[1].predict_rule, PredictRule::Hebbian);
    }

    #[test]
    fn mismatched_params_are_rejected() {
        let config = HierarchyConfig {
            params: vec![LayerParams::default()],
            ..Default::default()
        };

        assert!(matches!(config.build(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(HierarchyConfig::from_json("{ layers: "), Err(Error::Config(_))));
    }
}
