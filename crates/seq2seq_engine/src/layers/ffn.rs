//! Position-wise feed-forward sublayer

use crate::error::Result;
use crate::layers::{Dense, LayerNorm};
use crate::model::VariableIndex;
use crate::ops;
use crate::storage::Storage;
use crate::types::DataType;

/// Pre-norm feed-forward: `output = input + W2 * relu(W1 * LN(input))`.
pub struct FeedForward {
    layer_norm: LayerNorm,
    linear_1: Dense,
    linear_2: Dense,
}

impl FeedForward {
    pub fn load(index: &VariableIndex, scope: &str) -> Result<FeedForward> {
        Ok(FeedForward {
            layer_norm: LayerNorm::load(index, &format!("{}/layer_norm", scope))?,
            linear_1: Dense::load(index, &format!("{}/linear_1", scope))?,
            linear_2: Dense::load(index, &format!("{}/linear_2", scope))?,
        })
    }

    pub fn forward(&self, input: &Storage, output: &mut Storage) -> Result<()> {
        let mut normed = Storage::new(input.device(), DataType::F32);
        self.layer_norm.forward(input, &mut normed)?;
        let mut inner = Storage::new(input.device(), DataType::F32);
        self.linear_1.forward(&normed, &mut inner)?;
        let mut activated = Storage::new(input.device(), DataType::F32);
        ops::relu(&inner, &mut activated)?;
        let mut projected = Storage::new(input.device(), DataType::F32);
        self.linear_2.forward(&activated, &mut projected)?;
        ops::add(&projected, input, output)
    }
}
