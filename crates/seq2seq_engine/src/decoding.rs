//! Greedy and beam search over a decoder
//!
//! Both drivers step the decoder one target position at a time, carrying
//! the KV caches in the decoder state. Beam search additionally reorders
//! the whole state by parent beam after each expansion, which is a gather
//! along the batch axis of every cache tensor.

use crate::device::Device;
use crate::error::{Error, Result};
use crate::layers::{Decoder, DecoderState};
use crate::ops;
use crate::storage::Storage;
use crate::types::DataType;

/// Per-sample search output. Hypotheses are real-vocabulary token ids and
/// never include the end token.
pub struct SearchResult {
    pub sampled_ids: Vec<Vec<Vec<usize>>>,
    pub scores: Vec<Vec<f32>>,
    /// `[sample][hypothesis][target_pos][source_pos]`; empty when attention
    /// was not requested.
    pub attention: Vec<Vec<Vec<Vec<f32>>>>,
}

/// GNMT length normalization: `score / ((5 + length) / 6)^penalty`.
pub fn length_penalized_score(score: f32, length: usize, penalty: f32) -> f32 {
    score / ((5.0 + length as f32) / 6.0).powf(penalty)
}

/// Position of the end token in the effective output space, and the map
/// back from output indices to real vocabulary ids.
struct CandidateSpace<'a> {
    candidates: Option<&'a [i32]>,
    end_index: usize,
}

impl<'a> CandidateSpace<'a> {
    fn new(candidates: Option<&'a [i32]>, end_token: usize) -> Result<CandidateSpace<'a>> {
        let end_index = match candidates {
            Some(candidates) => candidates
                .iter()
                .position(|&id| id as usize == end_token)
                .ok_or_else(|| {
                    Error::precondition("the candidate list does not contain the end token")
                })?,
            None => end_token,
        };
        Ok(CandidateSpace {
            candidates,
            end_index,
        })
    }

    fn to_vocab(&self, index: usize) -> usize {
        match self.candidates {
            Some(candidates) => candidates[index] as usize,
            None => index,
        }
    }
}

fn ids_storage(ids: &[i32]) -> Result<Storage> {
    Storage::from_vec(ids.to_vec(), &[ids.len(), 1])
}

fn attention_rows(attention: &Storage) -> Result<Vec<Vec<f32>>> {
    let src_len = attention.dim(1);
    Ok(attention
        .data::<f32>()?
        .chunks(src_len)
        .map(<[f32]>::to_vec)
        .collect())
}

/// Greedy decoding: one beam per sample, argmax at every step.
#[allow(clippy::too_many_arguments)]
pub fn greedy_search(
    decoder: &mut dyn Decoder,
    state: &mut DecoderState,
    start_ids: &[i32],
    candidates: Option<&[i32]>,
    start_step: usize,
    end_token: usize,
    max_length: usize,
    min_length: usize,
    return_attention: bool,
) -> Result<SearchResult> {
    let batch_size = start_ids.len();
    let space = CandidateSpace::new(candidates, end_token)?;
    decoder.reserve_positions(max_length);

    let mut sample_from = start_ids.to_vec();
    let mut alive = vec![true; batch_size];
    let mut sampled_ids = vec![vec![Vec::new()]; batch_size];
    let mut scores = vec![0f32; batch_size];
    let mut attention_traces: Vec<Vec<Vec<f32>>> = vec![Vec::new(); batch_size];

    let mut log_probs = Storage::new(Device::Cpu, DataType::F32);
    let mut attention = Storage::new(Device::Cpu, DataType::F32);

    for step in start_step..max_length {
        let ids = ids_storage(&sample_from)?;
        decoder.log_probs(
            step,
            &ids,
            state,
            &mut log_probs,
            return_attention.then_some(&mut attention),
        )?;
        let vocab_size = log_probs.dim(1);
        let probs = log_probs.data::<f32>()?;
        let step_attention = if return_attention {
            attention_rows(&attention)?
        } else {
            Vec::new()
        };

        let mut all_finished = true;
        for i in 0..batch_size {
            if !alive[i] {
                continue;
            }
            let row = &probs[i * vocab_size..(i + 1) * vocab_size];
            let mut best = 0;
            let mut best_score = f32::NEG_INFINITY;
            for (v, &value) in row.iter().enumerate() {
                if step < min_length && v == space.end_index {
                    continue;
                }
                if value > best_score {
                    best = v;
                    best_score = value;
                }
            }
            scores[i] += best_score;
            if best == space.end_index {
                alive[i] = false;
            } else {
                sampled_ids[i][0].push(space.to_vocab(best));
                if return_attention {
                    attention_traces[i].push(step_attention[i].clone());
                }
                sample_from[i] = space.to_vocab(best) as i32;
                all_finished = false;
            }
        }
        if all_finished {
            break;
        }
    }

    Ok(SearchResult {
        sampled_ids,
        scores: scores.into_iter().map(|score| vec![score]).collect(),
        attention: if return_attention {
            attention_traces
                .into_iter()
                .map(|trace| vec![trace])
                .collect()
        } else {
            Vec::new()
        },
    })
}

struct FinishedHypothesis {
    normalized_score: f32,
    ids: Vec<usize>,
    attention: Vec<Vec<f32>>,
}

/// Beam search with GNMT length penalty.
///
/// The state must describe `batch_size` sequences; it is tiled to
/// `batch_size * beam_size` here. A sample is done once `num_hypotheses`
/// of its hypotheses have finished or the maximum length is reached, in
/// which case the best unfinished beams fill the remaining slots.
#[allow(clippy::too_many_arguments)]
pub fn beam_search(
    decoder: &mut dyn Decoder,
    state: &mut DecoderState,
    start_ids: &[i32],
    candidates: Option<&[i32]>,
    start_step: usize,
    end_token: usize,
    max_length: usize,
    min_length: usize,
    beam_size: usize,
    num_hypotheses: usize,
    length_penalty: f32,
    return_attention: bool,
) -> Result<SearchResult> {
    let batch_size = start_ids.len();
    let space = CandidateSpace::new(candidates, end_token)?;
    decoder.reserve_positions(max_length);

    // Tile every state tensor to batch * beam.
    let tile: Vec<i32> = (0..batch_size as i32)
        .flat_map(|b| std::iter::repeat(b).take(beam_size))
        .collect();
    state.gather_batch(&Storage::from_vec(tile, &[batch_size * beam_size])?)?;

    let total_beams = batch_size * beam_size;
    let mut sample_from: Vec<i32> = start_ids
        .iter()
        .flat_map(|&id| std::iter::repeat(id).take(beam_size))
        .collect();
    // Only the first beam of each sample is live at the start; the others
    // would expand into duplicates.
    let mut cum_scores = vec![f32::NEG_INFINITY; total_beams];
    for b in 0..batch_size {
        cum_scores[b * beam_size] = 0.0;
    }
    let mut alive_seq: Vec<Vec<usize>> = vec![Vec::new(); total_beams];
    let mut attention_traces: Vec<Vec<Vec<f32>>> = vec![Vec::new(); total_beams];
    let mut finished: Vec<Vec<FinishedHypothesis>> = (0..batch_size).map(|_| Vec::new()).collect();
    let mut sample_done = vec![false; batch_size];

    let mut log_probs = Storage::new(Device::Cpu, DataType::F32);
    let mut attention = Storage::new(Device::Cpu, DataType::F32);

    for step in start_step..max_length {
        let ids = ids_storage(&sample_from)?;
        decoder.log_probs(
            step,
            &ids,
            state,
            &mut log_probs,
            return_attention.then_some(&mut attention),
        )?;
        let vocab_size = log_probs.dim(1);
        let step_attention = if return_attention {
            attention_rows(&attention)?
        } else {
            Vec::new()
        };

        // Expand: cumulative score of every (beam, token) continuation.
        let probs = log_probs.data::<f32>()?;
        let mut combined = vec![f32::NEG_INFINITY; total_beams * vocab_size];
        for beam in 0..total_beams {
            if cum_scores[beam] == f32::NEG_INFINITY {
                continue;
            }
            let row = &probs[beam * vocab_size..(beam + 1) * vocab_size];
            let out = &mut combined[beam * vocab_size..(beam + 1) * vocab_size];
            for (v, &value) in row.iter().enumerate() {
                if step < min_length && v == space.end_index {
                    continue;
                }
                out[v] = cum_scores[beam] + value;
            }
        }
        let combined = Storage::from_vec(combined, &[batch_size, beam_size * vocab_size])?;
        let k = (2 * beam_size).min(beam_size * vocab_size);
        let mut top_values = Storage::new(Device::Cpu, DataType::F32);
        let mut top_indices = Storage::new(Device::Cpu, DataType::I32);
        ops::topk(&combined, k, &mut top_values, &mut top_indices)?;
        let top_values = top_values.data::<f32>()?;
        let top_indices = top_indices.data::<i32>()?;

        // Select the next beams and record finished hypotheses.
        let mut parents = vec![0i32; total_beams];
        let mut tokens = vec![0usize; total_beams];
        let mut next_scores = vec![f32::NEG_INFINITY; total_beams];
        for b in 0..batch_size {
            if sample_done[b] {
                for slot in 0..beam_size {
                    parents[b * beam_size + slot] = (b * beam_size + slot) as i32;
                }
                continue;
            }
            // Walk the ranked candidates. An end token inside the selection
            // window finishes a hypothesis and its slot is backfilled by
            // the next best alternative; the walk stops once the beam is
            // full, so a hypothesis can only finish when the end token
            // outranks a surviving continuation.
            let mut slot = 0;
            for j in 0..k {
                if slot == beam_size {
                    break;
                }
                let score = top_values[b * k + j];
                if score == f32::NEG_INFINITY {
                    break;
                }
                let flat = top_indices[b * k + j] as usize;
                let beam = b * beam_size + flat / vocab_size;
                let token = flat % vocab_size;
                if token == space.end_index {
                    if finished[b].len() < num_hypotheses {
                        let length = alive_seq[beam].len() + 1;
                        finished[b].push(FinishedHypothesis {
                            normalized_score: length_penalized_score(
                                score,
                                length,
                                length_penalty,
                            ),
                            ids: alive_seq[beam].clone(),
                            attention: attention_traces[beam].clone(),
                        });
                        if finished[b].len() >= num_hypotheses {
                            sample_done[b] = true;
                            break;
                        }
                    }
                } else {
                    parents[b * beam_size + slot] = beam as i32;
                    tokens[b * beam_size + slot] = token;
                    next_scores[b * beam_size + slot] = score;
                    slot += 1;
                }
            }
            // Dead slots keep stepping on beam 0's state but can never win.
            for unfilled in slot..beam_size {
                parents[b * beam_size + unfilled] = (b * beam_size) as i32;
                tokens[b * beam_size + unfilled] = space.end_index;
            }
            if sample_done[b] {
                for slot in 0..beam_size {
                    parents[b * beam_size + slot] = (b * beam_size + slot) as i32;
                }
            }
        }

        if sample_done.iter().all(|&done| done) {
            break;
        }

        // Reorder all per-beam state by the parent indices.
        state.gather_batch(&Storage::from_vec(parents.clone(), &[total_beams])?)?;
        let mut new_seq = Vec::with_capacity(total_beams);
        let mut new_traces = Vec::with_capacity(total_beams);
        for (beam, &parent) in parents.iter().enumerate() {
            let b = beam / beam_size;
            let parent = parent as usize;
            let mut seq = alive_seq[parent].clone();
            let mut trace = attention_traces[parent].clone();
            if !sample_done[b] && next_scores[beam] != f32::NEG_INFINITY {
                seq.push(space.to_vocab(tokens[beam]));
                if return_attention {
                    trace.push(step_attention[parent].clone());
                }
                sample_from[beam] = space.to_vocab(tokens[beam]) as i32;
            }
            new_seq.push(seq);
            new_traces.push(trace);
        }
        alive_seq = new_seq;
        attention_traces = new_traces;
        for beam in 0..total_beams {
            if !sample_done[beam / beam_size] {
                cum_scores[beam] = next_scores[beam];
            }
        }
    }

    // Fill remaining hypothesis slots from the best unfinished beams.
    for b in 0..batch_size {
        if finished[b].len() >= num_hypotheses {
            continue;
        }
        let mut alive: Vec<usize> = (b * beam_size..(b + 1) * beam_size)
            .filter(|&beam| cum_scores[beam] != f32::NEG_INFINITY)
            .collect();
        alive.sort_by(|&x, &y| cum_scores[y].total_cmp(&cum_scores[x]));
        for beam in alive {
            if finished[b].len() >= num_hypotheses {
                break;
            }
            finished[b].push(FinishedHypothesis {
                normalized_score: length_penalized_score(
                    cum_scores[beam],
                    alive_seq[beam].len() + 1,
                    length_penalty,
                ),
                ids: alive_seq[beam].clone(),
                attention: attention_traces[beam].clone(),
            });
        }
    }

    let mut sampled_ids = Vec::with_capacity(batch_size);
    let mut scores = Vec::with_capacity(batch_size);
    let mut attention_out = Vec::with_capacity(batch_size);
    for mut hypotheses in finished {
        hypotheses.sort_by(|x, y| y.normalized_score.total_cmp(&x.normalized_score));
        hypotheses.truncate(num_hypotheses);
        sampled_ids.push(hypotheses.iter().map(|h| h.ids.clone()).collect());
        scores.push(hypotheses.iter().map(|h| h.normalized_score).collect());
        if return_attention {
            attention_out.push(hypotheses.into_iter().map(|h| h.attention).collect());
        }
    }

    Ok(SearchResult {
        sampled_ids,
        scores,
        attention: attention_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::DecoderState;

    #[test]
    fn length_penalty_prefers_the_longer_hypothesis() {
        // score -4 at length 4 vs score -5 at length 8, penalty 1.
        let short = length_penalized_score(-4.0, 4, 1.0);
        let long = length_penalized_score(-5.0, 8, 1.0);
        assert!(long > short);
        assert!((short - (-4.0 / 1.5)).abs() < 1e-6);
        assert!((long - (-5.0 * 6.0 / 13.0)).abs() < 1e-6);
    }

    #[test]
    fn zero_penalty_is_the_identity() {
        assert_eq!(length_penalized_score(-3.5, 17, 0.0), -3.5);
    }

    /// Scripted decoder: at each step the log-probabilities are a fixed
    /// table, whatever the state. Vocabulary: 0..5, end token 3.
    struct ScriptedDecoder {
        steps: Vec<Vec<f32>>,
    }

    impl ScriptedDecoder {
        fn new() -> ScriptedDecoder {
            // Normalized enough for testing: step 0 favors token 1, step 1
            // favors token 2, step 2 favors the end token.
            ScriptedDecoder {
                steps: vec![
                    vec![-5.0, -0.1, -3.0, -4.0, -5.0],
                    vec![-5.0, -3.0, -0.2, -2.0, -5.0],
                    vec![-5.0, -4.0, -3.0, -0.3, -5.0],
                ],
            }
        }
    }

    impl Decoder for ScriptedDecoder {
        fn initial_state(&self, memory: Storage, memory_lengths: Storage) -> DecoderState {
            DecoderState::new(memory, memory_lengths, 0)
        }

        fn reduce_vocab(&mut self, _candidates: &Storage) -> Result<()> {
            Ok(())
        }

        fn log_probs(
            &mut self,
            step: usize,
            ids: &Storage,
            _state: &mut DecoderState,
            output: &mut Storage,
            _attention: Option<&mut Storage>,
        ) -> Result<()> {
            let row = self.steps[step.min(self.steps.len() - 1)].clone();
            let batch_size = ids.dim(0);
            let vocab = row.len();
            let mut data = Vec::with_capacity(batch_size * vocab);
            for _ in 0..batch_size {
                data.extend_from_slice(&row);
            }
            output.resize(&[batch_size, vocab])?;
            output.data_mut::<f32>()?.copy_from_slice(&data);
            Ok(())
        }
    }

    fn empty_state() -> DecoderState {
        DecoderState::new(
            Storage::zeros(Device::Cpu, DataType::F32, &[1, 1, 1]),
            Storage::from_vec(vec![1i32], &[1]).unwrap(),
            0,
        )
    }

    #[test]
    fn greedy_follows_the_argmax_and_stops_at_end() {
        let mut decoder = ScriptedDecoder::new();
        let mut state = empty_state();
        let result = greedy_search(&mut decoder, &mut state, &[2], None, 0, 3, 10, 1, false)
            .unwrap();
        assert_eq!(result.sampled_ids[0][0], vec![1, 2]);
        let expected = -0.1 + -0.2 + -0.3;
        assert!((result.scores[0][0] - expected).abs() < 1e-6);
    }

    #[test]
    fn min_length_postpones_the_end_token() {
        let mut decoder = ScriptedDecoder {
            steps: vec![
                vec![-5.0, -3.0, -4.0, -0.1, -5.0],
                vec![-5.0, -0.5, -4.0, -0.1, -5.0],
            ],
        };
        let mut state = empty_state();
        let result = greedy_search(&mut decoder, &mut state, &[2], None, 0, 3, 10, 1, false)
            .unwrap();
        // The end token wins step 0 but is masked; token 1 is the runner-up.
        assert_eq!(result.sampled_ids[0][0], vec![1]);
    }

    #[test]
    fn beam_one_matches_greedy_ids() {
        let mut decoder = ScriptedDecoder::new();
        let mut greedy_state = empty_state();
        let greedy = greedy_search(
            &mut decoder,
            &mut greedy_state,
            &[2],
            None,
            0,
            3,
            10,
            1,
            false,
        )
        .unwrap();

        let mut beam_state = empty_state();
        let beam = beam_search(
            &mut decoder,
            &mut beam_state,
            &[2],
            None,
            0,
            3,
            10,
            1,
            1,
            1,
            0.0,
            false,
        )
        .unwrap();
        assert_eq!(greedy.sampled_ids[0][0], beam.sampled_ids[0][0]);
    }

    #[test]
    fn beam_hypotheses_are_score_ordered_and_capped() {
        let mut decoder = ScriptedDecoder::new();
        let mut state = empty_state();
        let result = beam_search(
            &mut decoder,
            &mut state,
            &[2],
            None,
            0,
            3,
            6,
            1,
            4,
            4,
            0.0,
            false,
        )
        .unwrap();
        let scores = &result.scores[0];
        assert_eq!(scores.len(), 4);
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        for hypothesis in &result.sampled_ids[0] {
            assert!(hypothesis.len() <= 6);
            assert!(!hypothesis.contains(&3));
        }
    }

    #[test]
    fn candidate_restriction_maps_ids_back() {
        let mut decoder = ScriptedDecoder {
            // Reduced space of 3 entries; entry 1 wins, entry 2 is the end.
            steps: vec![
                vec![-3.0, -0.1, -2.0],
                vec![-3.0, -2.0, -0.1],
            ],
        };
        let mut state = empty_state();
        // Candidates: real ids 7, 9, 3 (end token 3 sits at index 2).
        let candidates: Vec<i32> = vec![7, 9, 3];
        let result = greedy_search(
            &mut decoder,
            &mut state,
            &[2],
            Some(&candidates),
            0,
            3,
            10,
            1,
            false,
        )
        .unwrap();
        assert_eq!(result.sampled_ids[0][0], vec![9]);
    }
}
