//! Transformer encoder stack

use crate::error::Result;
use crate::layers::{
    Encoder, FeedForward, LayerNorm, PositionEncoder, ScaledEmbeddings, SelfAttention,
};
use crate::model::VariableIndex;
use crate::storage::Storage;
use crate::types::DataType;

pub struct TransformerEncoderLayer {
    self_attention: SelfAttention,
    ffn: FeedForward,
}

impl TransformerEncoderLayer {
    pub fn load(index: &VariableIndex, scope: &str, num_heads: usize) -> Result<Self> {
        Ok(TransformerEncoderLayer {
            self_attention: SelfAttention::load(
                index,
                &format!("{}/self_attention", scope),
                num_heads,
            )?,
            ffn: FeedForward::load(index, &format!("{}/ffn", scope))?,
        })
    }

    pub fn forward(
        &self,
        input: &Storage,
        lengths: &Storage,
        output: &mut Storage,
    ) -> Result<()> {
        let mut attended = Storage::new(input.device(), DataType::F32);
        self.self_attention
            .forward(input, Some(lengths), None, &mut attended)?;
        self.ffn.forward(&attended, output)
    }
}

pub struct TransformerEncoder {
    embeddings: ScaledEmbeddings,
    position_encoder: PositionEncoder,
    layers: Vec<TransformerEncoderLayer>,
    output_norm: LayerNorm,
}

impl TransformerEncoder {
    pub fn load(index: &VariableIndex, num_layers: usize, num_heads: usize) -> Result<Self> {
        let embeddings = ScaledEmbeddings::load(index, "encoder/embeddings")?;
        let position_encoder = PositionEncoder::new(embeddings.depth())?;
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            layers.push(TransformerEncoderLayer::load(
                index,
                &format!("encoder/layer_{}", i),
                num_heads,
            )?);
        }
        Ok(TransformerEncoder {
            embeddings,
            position_encoder,
            layers,
            output_norm: LayerNorm::load(index, "encoder/layer_norm")?,
        })
    }
}

impl Encoder for TransformerEncoder {
    fn encode(&mut self, ids: &Storage, lengths: &Storage, output: &mut Storage) -> Result<()> {
        let mut hidden = Storage::new(ids.device(), DataType::F32);
        self.embeddings.forward(ids, &mut hidden)?;
        self.position_encoder.forward(&mut hidden, 0)?;

        let mut next = Storage::new(ids.device(), DataType::F32);
        for layer in &self.layers {
            layer.forward(&hidden, lengths, &mut next)?;
            std::mem::swap(&mut hidden, &mut next);
        }
        self.output_norm.forward(&hidden, output)
    }
}
