//! Shared fixture: a small deterministic model directory
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

use seq2seq_engine::model::save_model;
use seq2seq_engine::Storage;

pub const D_MODEL: usize = 4;
pub const NUM_HEADS: usize = 2;
pub const FFN_INNER: usize = 8;

pub const TOKENS: [&str; 8] = ["<blank>", "<unk>", "<s>", "</s>", "aa", "bb", "cc", "dd"];

/// Deterministic pseudo-random weights in roughly [-0.5, 0.5).
fn lcg(state: &mut u64) -> f32 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    (*state >> 33) as f32 / (1u64 << 31) as f32 - 0.5
}

fn random_matrix(state: &mut u64, rows: usize, cols: usize, scale: f32) -> Storage {
    let data: Vec<f32> = (0..rows * cols).map(|_| lcg(state) * scale).collect();
    Storage::from_vec(data, &[rows, cols]).unwrap()
}

fn zeros(size: usize) -> Storage {
    Storage::from_vec(vec![0.0f32; size], &[size]).unwrap()
}

fn ones(size: usize) -> Storage {
    Storage::from_vec(vec![1.0f32; size], &[size]).unwrap()
}

fn norm_scope(variables: &mut Vec<(String, Storage)>, scope: &str) {
    variables.push((format!("{}/gamma", scope), ones(D_MODEL)));
    variables.push((format!("{}/beta", scope), zeros(D_MODEL)));
}

fn dense_scope(
    variables: &mut Vec<(String, Storage)>,
    state: &mut u64,
    scope: &str,
    out_dim: usize,
    in_dim: usize,
    scale: f32,
) {
    variables.push((
        format!("{}/weight", scope),
        random_matrix(state, out_dim, in_dim, scale),
    ));
    variables.push((format!("{}/bias", scope), zeros(out_dim)));
}

fn attention_scope(variables: &mut Vec<(String, Storage)>, state: &mut u64, scope: &str) {
    norm_scope(variables, &format!("{}/layer_norm", scope));
    dense_scope(
        variables,
        state,
        &format!("{}/linear_in", scope),
        3 * D_MODEL,
        D_MODEL,
        0.4,
    );
    dense_scope(
        variables,
        state,
        &format!("{}/linear_out", scope),
        D_MODEL,
        D_MODEL,
        0.4,
    );
}

fn ffn_scope(variables: &mut Vec<(String, Storage)>, state: &mut u64, scope: &str) {
    norm_scope(variables, &format!("{}/layer_norm", scope));
    dense_scope(
        variables,
        state,
        &format!("{}/linear_1", scope),
        FFN_INNER,
        D_MODEL,
        0.4,
    );
    dense_scope(
        variables,
        state,
        &format!("{}/linear_2", scope),
        D_MODEL,
        FFN_INNER,
        0.4,
    );
}

/// All variables of the toy model. The projection bias dominates the
/// logits so greedy decoding is deterministic and stable under int8
/// quantization: "aa" always wins, "</s>" is the runner-up.
pub fn model_variables() -> Vec<(String, Storage)> {
    let vocab_size = TOKENS.len();
    let mut state = 0x00c0ffee;
    let mut variables: Vec<(String, Storage)> = Vec::new();

    variables.push((
        "num_heads".to_string(),
        Storage::from_vec(vec![NUM_HEADS as i32], &[1]).unwrap(),
    ));

    variables.push((
        "encoder/embeddings".to_string(),
        random_matrix(&mut state, vocab_size, D_MODEL, 1.0),
    ));
    attention_scope(&mut variables, &mut state, "encoder/layer_0/self_attention");
    ffn_scope(&mut variables, &mut state, "encoder/layer_0/ffn");
    norm_scope(&mut variables, "encoder/layer_norm");

    variables.push((
        "decoder/embeddings".to_string(),
        random_matrix(&mut state, vocab_size, D_MODEL, 1.0),
    ));
    attention_scope(&mut variables, &mut state, "decoder/layer_0/self_attention");
    let cross = "decoder/layer_0/attention";
    norm_scope(&mut variables, &format!("{}/layer_norm", cross));
    dense_scope(
        &mut variables,
        &mut state,
        &format!("{}/linear_query", cross),
        D_MODEL,
        D_MODEL,
        0.4,
    );
    dense_scope(
        &mut variables,
        &mut state,
        &format!("{}/linear_memory", cross),
        2 * D_MODEL,
        D_MODEL,
        0.4,
    );
    dense_scope(
        &mut variables,
        &mut state,
        &format!("{}/linear_out", cross),
        D_MODEL,
        D_MODEL,
        0.4,
    );
    ffn_scope(&mut variables, &mut state, "decoder/layer_0/ffn");
    norm_scope(&mut variables, "decoder/layer_norm");

    variables.push((
        "decoder/projection/weight".to_string(),
        random_matrix(&mut state, vocab_size, D_MODEL, 0.02),
    ));
    let bias = vec![-10.0f32, -10.0, -10.0, 1.0, 2.0, 0.5, 0.0, -1.0];
    variables.push((
        "decoder/projection/bias".to_string(),
        Storage::from_vec(bias, &[vocab_size]).unwrap(),
    ));

    variables
}

fn write_vocabulary(path: &Path) {
    let mut file = std::fs::File::create(path).unwrap();
    for token in TOKENS {
        writeln!(file, "{}", token).unwrap();
    }
}

/// Writes a complete model directory and returns its path holder.
pub fn write_model_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let variables = model_variables();
    let refs: Vec<(&str, &Storage)> = variables
        .iter()
        .map(|(name, storage)| (name.as_str(), storage))
        .collect();
    save_model(dir.path().join("model.bin"), 2, &refs).unwrap();
    write_vocabulary(&dir.path().join("source_vocabulary.txt"));
    write_vocabulary(&dir.path().join("target_vocabulary.txt"));
    dir
}

/// Adds a vocabulary map file mapping "aa" to "dd".
pub fn write_vocabulary_map(dir: &Path) {
    let mut file = std::fs::File::create(dir.join("vocabulary_map.txt")).unwrap();
    writeln!(file, "aa\tdd").unwrap();
}
