//! Transformer layers assembled from the primitive op library
//!
//! Layers are cheap value types: they hold non-owning aliases into the
//! model's weight index, plus their own scratch storages. A fresh graph
//! (encoder or decoder) can be built per thread without duplicating any
//! weight.

mod attention;
mod dense;
mod embeddings;
mod encoder;
mod decoder;
mod ffn;
mod norm;
mod position;

pub use attention::{CrossAttention, SelfAttention};
pub use dense::Dense;
pub use decoder::{DecoderState, LayerCache, TransformerDecoder, TransformerDecoderLayer};
pub use embeddings::ScaledEmbeddings;
pub use encoder::{TransformerEncoder, TransformerEncoderLayer};
pub use ffn::FeedForward;
pub use norm::LayerNorm;
pub use position::PositionEncoder;

use crate::error::Result;
use crate::storage::Storage;

/// Maps token ids to a memory tensor for the decoder.
pub trait Encoder {
    /// `ids[B, T]` and `lengths[B]` to `output[B, T, d]`.
    fn encode(&mut self, ids: &Storage, lengths: &Storage, output: &mut Storage) -> Result<()>;
}

/// Steps over target tokens, producing log-probabilities per step.
pub trait Decoder {
    /// Builds the per-beam cache record for a new decoding run.
    fn initial_state(&self, memory: Storage, memory_lengths: Storage) -> DecoderState;

    /// Restricts the output projection to `candidates` (empty storage
    /// restores the full vocabulary). Performed once per decoding run.
    fn reduce_vocab(&mut self, candidates: &Storage) -> Result<()>;

    /// Precomputation hook called with the maximum step count before a
    /// decoding run starts.
    fn reserve_positions(&mut self, _max_length: usize) {}

    /// Computes `output[B, V_eff]` log-probabilities for step `step` given
    /// the previous tokens `ids[B, 1]`. When `attention` is given it
    /// receives the cross-attention distribution `[B, src_len]` of the
    /// step.
    fn log_probs(
        &mut self,
        step: usize,
        ids: &Storage,
        state: &mut DecoderState,
        output: &mut Storage,
        attention: Option<&mut Storage>,
    ) -> Result<()>;
}
