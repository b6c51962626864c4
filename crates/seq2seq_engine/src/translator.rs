//! Translation facade: tokens in, scored hypotheses out

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decoding::{beam_search, greedy_search, SearchResult};
use crate::device::ScopedDeviceSetter;
use crate::error::{Error, Result};
use crate::layers::{Decoder, Encoder};
use crate::model::{SequenceToSequenceModel, Vocabulary};
use crate::storage::Storage;
use crate::types::DataType;

/// Decoding options checked at the translate boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationOptions {
    pub beam_size: usize,
    pub num_hypotheses: usize,
    pub length_penalty: f32,
    pub max_decoding_length: usize,
    pub min_decoding_length: usize,
    pub use_vmap: bool,
    pub return_attention: bool,
}

impl Default for TranslationOptions {
    fn default() -> TranslationOptions {
        TranslationOptions {
            beam_size: 1,
            num_hypotheses: 1,
            length_penalty: 0.0,
            max_decoding_length: 250,
            min_decoding_length: 1,
            use_vmap: false,
            return_attention: false,
        }
    }
}

/// Hypotheses for one input, in descending score order.
pub struct TranslationResult {
    hypotheses: Vec<Vec<String>>,
    scores: Vec<f32>,
    attention: Option<Vec<Vec<Vec<f32>>>>,
}

impl TranslationResult {
    /// The best hypothesis.
    pub fn output(&self) -> &[String] {
        &self.hypotheses[0]
    }

    pub fn hypotheses(&self) -> &[Vec<String>] {
        &self.hypotheses
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn num_hypotheses(&self) -> usize {
        self.hypotheses.len()
    }

    /// Per hypothesis, one `[target_len][source_len]` attention matrix.
    pub fn attention(&self) -> Option<&[Vec<Vec<f32>>]> {
        self.attention.as_deref()
    }
}

/// Drives the whole pipeline: ids, encode, (vmap) candidates, prefix
/// forcing, search, detokenized hypotheses.
pub struct Translator {
    model: Arc<dyn SequenceToSequenceModel>,
    encoder: Box<dyn Encoder + Send>,
    decoder: Box<dyn Decoder + Send>,
}

impl Translator {
    pub fn new(model: Arc<dyn SequenceToSequenceModel>) -> Result<Translator> {
        let _device_setter = ScopedDeviceSetter::new(model.device());
        let encoder = model.make_encoder()?;
        let decoder = model.make_decoder()?;
        Ok(Translator {
            model,
            encoder,
            decoder,
        })
    }

    /// A new translator on the same shared model, with fresh graphs. The
    /// weights are not copied, so clones are cheap and can run on other
    /// threads.
    pub fn try_clone(&self) -> Result<Translator> {
        Translator::new(Arc::clone(&self.model))
    }

    pub fn translate(&mut self, tokens: &[String]) -> Result<TranslationResult> {
        self.translate_with_options(tokens, &TranslationOptions::default())
    }

    pub fn translate_with_options(
        &mut self,
        tokens: &[String],
        options: &TranslationOptions,
    ) -> Result<TranslationResult> {
        let batch = vec![tokens.to_vec()];
        let mut results = self.translate_batch(&batch, options)?;
        Ok(results.remove(0))
    }

    pub fn translate_with_prefix(
        &mut self,
        tokens: &[String],
        target_prefix: &[String],
        options: &TranslationOptions,
    ) -> Result<TranslationResult> {
        let batch = vec![tokens.to_vec()];
        let prefix = vec![target_prefix.to_vec()];
        let mut results = self.translate_batch_with_prefix(&batch, Some(&prefix), options)?;
        Ok(results.remove(0))
    }

    pub fn translate_batch(
        &mut self,
        source: &[Vec<String>],
        options: &TranslationOptions,
    ) -> Result<Vec<TranslationResult>> {
        self.translate_batch_with_prefix(source, None, options)
    }

    pub fn translate_batch_with_prefix(
        &mut self,
        source: &[Vec<String>],
        target_prefix: Option<&[Vec<String>]>,
        options: &TranslationOptions,
    ) -> Result<Vec<TranslationResult>> {
        let batch_size = source.len();
        self.check_options(options, source, target_prefix)?;

        let _device_setter = ScopedDeviceSetter::new(self.model.device());
        let source_vocabulary = self.model.source_vocabulary();
        let target_vocabulary = self.model.target_vocabulary();
        debug!(
            batch_size,
            beam_size = options.beam_size,
            use_vmap = options.use_vmap,
            "translating batch"
        );

        let (ids, lengths) = make_inputs(source, source_vocabulary)?;
        let mut encoded = Storage::new(self.model.device(), DataType::F32);
        self.encoder.encode(&ids, &lengths, &mut encoded)?;

        // Restrict (or restore) the output vocabulary for this batch.
        let candidates: Option<Vec<i32>> = if options.use_vmap {
            self.model
                .vocabulary_map()
                .map(|map| map.get_candidates(source))
        } else {
            None
        };
        let candidates_storage = match &candidates {
            Some(ids) => Storage::from_vec(ids.clone(), &[ids.len()])?,
            None => Storage::new(self.model.device(), DataType::I32),
        };
        self.decoder.reduce_vocab(&candidates_storage)?;

        let mut state = self.decoder.initial_state(encoded, lengths);
        let bos = target_vocabulary.bos_id() as i32;
        let eos = target_vocabulary.eos_id();
        let mut sample_from = vec![bos; batch_size];

        // Forward the target prefix, accumulating cache state without
        // sampling.
        let mut start_step = 0;
        let prefix = target_prefix.and_then(|prefix| prefix.first()).filter(|p| !p.is_empty());
        if let Some(prefix) = prefix {
            let mut scratch = Storage::new(self.model.device(), DataType::F32);
            for (i, token) in prefix.iter().enumerate() {
                let ids = Storage::from_vec(sample_from.clone(), &[batch_size, 1])?;
                self.decoder
                    .log_probs(i, &ids, &mut state, &mut scratch, None)?;
                sample_from[0] = target_vocabulary.to_id(token) as i32;
            }
            start_step = prefix.len();
        }

        let search = if options.beam_size == 1 {
            greedy_search(
                self.decoder.as_mut(),
                &mut state,
                &sample_from,
                candidates.as_deref(),
                start_step,
                eos,
                options.max_decoding_length,
                options.min_decoding_length,
                options.return_attention,
            )?
        } else {
            beam_search(
                self.decoder.as_mut(),
                &mut state,
                &sample_from,
                candidates.as_deref(),
                start_step,
                eos,
                options.max_decoding_length,
                options.min_decoding_length,
                options.beam_size,
                options.num_hypotheses,
                options.length_penalty,
                options.return_attention,
            )?
        };

        build_results(search, prefix, target_vocabulary, options.return_attention)
    }

    fn check_options(
        &self,
        options: &TranslationOptions,
        source: &[Vec<String>],
        target_prefix: Option<&[Vec<String>]>,
    ) -> Result<()> {
        if source.is_empty() {
            return Err(Error::precondition("empty batch"));
        }
        if options.beam_size == 0 || options.num_hypotheses == 0 {
            return Err(Error::precondition(
                "beam_size and num_hypotheses must be at least 1",
            ));
        }
        if options.num_hypotheses > options.beam_size {
            return Err(Error::precondition(
                "the number of hypotheses can not be greater than the beam size",
            ));
        }
        if options.length_penalty < 0.0 {
            return Err(Error::precondition("length_penalty can not be negative"));
        }
        if options.max_decoding_length == 0 {
            return Err(Error::precondition(
                "max_decoding_length must be at least 1",
            ));
        }
        if options.min_decoding_length > options.max_decoding_length {
            return Err(Error::precondition(
                "min_decoding_length is greater than max_decoding_length",
            ));
        }
        if options.use_vmap && self.model.vocabulary_map().map_or(true, |map| map.is_empty()) {
            return Err(Error::precondition(
                "use_vmap is set but the model does not include a vocabulary map",
            ));
        }
        if let Some(prefix) = target_prefix {
            if options.return_attention {
                return Err(Error::precondition(
                    "prefixed translation does not support returning attention vectors",
                ));
            }
            if source.len() > 1 {
                return Err(Error::precondition(
                    "prefixed translation does not support batch inputs",
                ));
            }
            if prefix.len() != source.len() {
                return Err(Error::precondition(format!(
                    "batch size mismatch: got {} for source and {} for target prefix",
                    source.len(),
                    prefix.len()
                )));
            }
        }
        Ok(())
    }
}

/// Converts batch tokens to padded `ids[B, T_max]` and `lengths[B]`.
fn make_inputs(source: &[Vec<String>], vocabulary: &Vocabulary) -> Result<(Storage, Storage)> {
    let batch_size = source.len();
    let max_length = source.iter().map(Vec::len).max().unwrap_or(0);
    if max_length == 0 {
        return Err(Error::precondition("all source sequences are empty"));
    }

    let mut lengths = vec![0i32; batch_size];
    let mut ids = vec![0i32; batch_size * max_length];
    for (i, tokens) in source.iter().enumerate() {
        lengths[i] = tokens.len() as i32;
        for (t, token) in tokens.iter().enumerate() {
            ids[i * max_length + t] = vocabulary.to_id(token) as i32;
        }
    }
    Ok((
        Storage::from_vec(ids, &[batch_size, max_length])?,
        Storage::from_vec(lengths, &[batch_size])?,
    ))
}

fn build_results(
    search: SearchResult,
    prefix: Option<&Vec<String>>,
    vocabulary: &Vocabulary,
    with_attention: bool,
) -> Result<Vec<TranslationResult>> {
    let mut results = Vec::with_capacity(search.sampled_ids.len());
    for (i, hypotheses_ids) in search.sampled_ids.iter().enumerate() {
        let mut hypotheses = Vec::with_capacity(hypotheses_ids.len());
        for ids in hypotheses_ids {
            let mut tokens: Vec<String> = match prefix {
                Some(prefix) => prefix.clone(),
                None => Vec::new(),
            };
            for &id in ids {
                tokens.push(vocabulary.to_token(id)?.to_string());
            }
            hypotheses.push(tokens);
        }
        results.push(TranslationResult {
            hypotheses,
            scores: search.scores[i].clone(),
            attention: if with_attention {
                Some(search.attention[i].clone())
            } else {
                None
            },
        });
    }
    Ok(results)
}
