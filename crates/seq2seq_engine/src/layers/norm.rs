//! Layer normalization with learned gamma and beta

use crate::error::Result;
use crate::model::VariableIndex;
use crate::ops;
use crate::storage::Storage;

const EPSILON: f32 = 1e-6;

pub struct LayerNorm {
    gamma: Storage,
    beta: Storage,
}

impl LayerNorm {
    pub fn load(index: &VariableIndex, scope: &str) -> Result<LayerNorm> {
        Ok(LayerNorm {
            gamma: index.get(&format!("{}/gamma", scope))?,
            beta: index.get(&format!("{}/beta", scope))?,
        })
    }

    pub fn forward(&self, input: &Storage, output: &mut Storage) -> Result<()> {
        ops::layer_norm(&self.gamma, &self.beta, input, output, EPSILON)
    }
}
