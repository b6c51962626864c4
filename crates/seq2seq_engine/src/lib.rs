//! Inference engine for Transformer sequence-to-sequence models
//!
//! Runs pre-trained encoder-decoder models over a typed, device-aware
//! tensor runtime: batched source sequences go in, scored target
//! hypotheses come out via greedy or beam-search decoding, optionally
//! restricted by a vocabulary map and seeded with a target prefix.

pub mod allocator;
pub mod decoding;
pub mod device;
pub mod error;
pub mod kernels;
pub mod layers;
pub mod model;
pub mod ops;
pub mod random;
pub mod storage;
pub mod translator;
pub mod types;

#[cfg(feature = "cuda")]
pub mod cuda;

// Primary public API re-exports
pub use decoding::{beam_search, greedy_search, length_penalized_score, SearchResult};
pub use device::{get_device, set_device, Device, ScopedDeviceSetter};
pub use error::{Error, Result};
pub use model::{SequenceToSequenceModel, TransformerModel, Vocabulary, VocabularyMap};
pub use random::set_random_seed;
pub use storage::Storage;
pub use translator::{TranslationOptions, TranslationResult, Translator};
pub use types::{ComputeType, DataType};
