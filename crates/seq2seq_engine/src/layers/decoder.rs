//! Transformer decoder stack and its per-step state

use crate::error::{Error, Result};
use crate::layers::{
    CrossAttention, Decoder, Dense, FeedForward, LayerNorm, PositionEncoder, ScaledEmbeddings,
    SelfAttention,
};
use crate::model::VariableIndex;
use crate::ops;
use crate::storage::Storage;
use crate::types::DataType;

/// Per-layer cache tensors.
///
/// `self_keys`/`self_values` grow by one time step per decoded token and
/// have shape `[batch * beam, heads, t, head_dim]`. `memory_keys`/
/// `memory_values` are projected from the encoder output on the first step
/// and stay constant.
#[derive(Default)]
pub struct LayerCache {
    pub self_keys: Option<Storage>,
    pub self_values: Option<Storage>,
    pub memory_keys: Option<Storage>,
    pub memory_values: Option<Storage>,
}

/// Decoder state carried between steps: the encoder memory plus one
/// `LayerCache` per decoder layer. Every tensor agrees on the batch
/// dimension.
pub struct DecoderState {
    pub memory: Storage,
    pub memory_lengths: Storage,
    pub layers: Vec<LayerCache>,
}

impl DecoderState {
    pub fn new(memory: Storage, memory_lengths: Storage, num_layers: usize) -> DecoderState {
        let mut layers = Vec::with_capacity(num_layers);
        layers.resize_with(num_layers, LayerCache::default);
        DecoderState {
            memory,
            memory_lengths,
            layers,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.memory.dim(0)
    }

    /// Reorders every state tensor along the batch axis. Used both to tile
    /// the state to `batch * beam` and to reorder beams by their parents.
    pub fn gather_batch(&mut self, indices: &Storage) -> Result<()> {
        let mut gathered = Storage::new(self.memory.device(), self.memory.dtype());
        ops::gather(&self.memory, indices, &mut gathered)?;
        self.memory = gathered;

        let mut gathered = Storage::new(self.memory_lengths.device(), DataType::I32);
        ops::gather(&self.memory_lengths, indices, &mut gathered)?;
        self.memory_lengths = gathered;

        for cache in &mut self.layers {
            for slot in [
                &mut cache.self_keys,
                &mut cache.self_values,
                &mut cache.memory_keys,
                &mut cache.memory_values,
            ] {
                if let Some(tensor) = slot.take() {
                    let mut gathered = Storage::new(tensor.device(), tensor.dtype());
                    ops::gather(&tensor, indices, &mut gathered)?;
                    *slot = Some(gathered);
                }
            }
        }
        Ok(())
    }
}

pub struct TransformerDecoderLayer {
    self_attention: SelfAttention,
    attention: CrossAttention,
    ffn: FeedForward,
}

impl TransformerDecoderLayer {
    pub fn load(index: &VariableIndex, scope: &str, num_heads: usize) -> Result<Self> {
        Ok(TransformerDecoderLayer {
            self_attention: SelfAttention::load(
                index,
                &format!("{}/self_attention", scope),
                num_heads,
            )?,
            attention: CrossAttention::load(index, &format!("{}/attention", scope), num_heads)?,
            ffn: FeedForward::load(index, &format!("{}/ffn", scope))?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        input: &Storage,
        memory: &Storage,
        memory_lengths: &Storage,
        cache: &mut LayerCache,
        output: &mut Storage,
        attention_out: Option<&mut Storage>,
    ) -> Result<()> {
        let mut attended = Storage::new(input.device(), DataType::F32);
        self.self_attention.forward(
            input,
            None,
            Some((&mut cache.self_keys, &mut cache.self_values)),
            &mut attended,
        )?;
        let mut crossed = Storage::new(input.device(), DataType::F32);
        self.attention.forward(
            &attended,
            memory,
            memory_lengths,
            &mut cache.memory_keys,
            &mut cache.memory_values,
            &mut crossed,
            attention_out,
        )?;
        self.ffn.forward(&crossed, output)
    }
}

pub struct TransformerDecoder {
    embeddings: ScaledEmbeddings,
    position_encoder: PositionEncoder,
    layers: Vec<TransformerDecoderLayer>,
    output_norm: LayerNorm,
    proj: Dense,
}

impl TransformerDecoder {
    pub fn load(index: &VariableIndex, num_layers: usize, num_heads: usize) -> Result<Self> {
        let embeddings = ScaledEmbeddings::load(index, "decoder/embeddings")?;
        let position_encoder = PositionEncoder::new(embeddings.depth())?;
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            layers.push(TransformerDecoderLayer::load(
                index,
                &format!("decoder/layer_{}", i),
                num_heads,
            )?);
        }
        Ok(TransformerDecoder {
            embeddings,
            position_encoder,
            layers,
            output_norm: LayerNorm::load(index, "decoder/layer_norm")?,
            proj: Dense::load(index, "decoder/projection")?,
        })
    }

    /// Effective output vocabulary size (restricted or full).
    pub fn output_size(&self) -> usize {
        self.proj.output_depth()
    }
}

impl Decoder for TransformerDecoder {
    fn initial_state(&self, memory: Storage, memory_lengths: Storage) -> DecoderState {
        DecoderState::new(memory, memory_lengths, self.layers.len())
    }

    fn reduce_vocab(&mut self, candidates: &Storage) -> Result<()> {
        self.proj.set_vocabulary(candidates)
    }

    fn reserve_positions(&mut self, max_length: usize) {
        self.position_encoder.reserve(max_length);
    }

    fn log_probs(
        &mut self,
        step: usize,
        ids: &Storage,
        state: &mut DecoderState,
        output: &mut Storage,
        attention: Option<&mut Storage>,
    ) -> Result<()> {
        if ids.rank() != 2 || ids.dim(1) != 1 {
            return Err(Error::precondition(format!(
                "decoder input must be [batch, 1], got {:?}",
                ids.shape()
            )));
        }
        let batch_size = ids.dim(0);

        let mut hidden = Storage::new(ids.device(), DataType::F32);
        self.embeddings.forward(ids, &mut hidden)?;
        self.position_encoder.forward(&mut hidden, step)?;

        let mut raw_attention = attention.as_ref().map(|_| Storage::new(ids.device(), DataType::F32));
        let last_layer = self.layers.len() - 1;
        let mut next = Storage::new(ids.device(), DataType::F32);
        for (i, layer) in self.layers.iter().enumerate() {
            let capture = if i == last_layer {
                raw_attention.as_mut()
            } else {
                None
            };
            layer.forward(
                &hidden,
                &state.memory,
                &state.memory_lengths,
                &mut state.layers[i],
                &mut next,
                capture,
            )?;
            std::mem::swap(&mut hidden, &mut next);
        }

        let mut normed = Storage::new(ids.device(), DataType::F32);
        self.output_norm.forward(&hidden, &mut normed)?;
        let mut logits = Storage::new(ids.device(), DataType::F32);
        self.proj.forward(&normed, &mut logits)?;
        logits.reshape(&[batch_size, self.proj.output_depth()])?;
        ops::log_softmax(&logits, output)?;

        // Average the captured cross-attention over heads: [B, h, 1, S]
        // down to [B, S].
        if let (Some(attention), Some(raw)) = (attention, raw_attention) {
            let num_heads = raw.dim(1);
            let src_len = raw.dim(3);
            attention.resize(&[batch_size, src_len])?;
            let raw_data = raw.data::<f32>()?.to_vec();
            let out_data = attention.data_mut::<f32>()?;
            for b in 0..batch_size {
                for s in 0..src_len {
                    let mut total = 0.0;
                    for h in 0..num_heads {
                        total += raw_data[(b * num_heads + h) * src_len + s];
                    }
                    out_data[b * src_len + s] = total / num_heads as f32;
                }
            }
        }
        Ok(())
    }
}
