//! Multi-head attention, self and cross, with KV caching

use crate::error::Result;
use crate::layers::{Dense, LayerNorm};
use crate::model::VariableIndex;
use crate::ops;
use crate::storage::Storage;
use crate::types::DataType;

/// `[B, T, d]` to `[B, h, T, d/h]`.
fn split_heads(x: &Storage, num_heads: usize) -> Result<Storage> {
    let (batch_size, time, depth) = (x.dim(0), x.dim(1), x.dim(2));
    let mut per_head = x.alias();
    per_head.reshape(&[batch_size, time, num_heads, depth / num_heads])?;
    let mut y = Storage::new(x.device(), x.dtype());
    ops::transpose(&per_head, &[0, 2, 1, 3], &mut y)?;
    Ok(y)
}

/// `[B, h, T, d/h]` back to `[B, T, d]`.
fn combine_heads(x: &Storage) -> Result<Storage> {
    let (batch_size, num_heads, time, head_dim) = (x.dim(0), x.dim(1), x.dim(2), x.dim(3));
    let mut y = Storage::new(x.device(), x.dtype());
    ops::transpose(x, &[0, 2, 1, 3], &mut y)?;
    y.reshape(&[batch_size, time, num_heads * head_dim])?;
    Ok(y)
}

/// Scaled dot-product attention over split heads.
///
/// `values_lengths` masks key positions at or past each batch entry's
/// length. `attention_out`, when set, receives the post-softmax weights
/// `[B, h, Tq, Tk]`.
fn dot_product_attention(
    queries: &Storage,
    keys: &Storage,
    values: &Storage,
    values_lengths: Option<&Storage>,
    output: &mut Storage,
    attention_out: Option<&mut Storage>,
) -> Result<()> {
    let (batch_size, num_heads, queries_time, head_dim) = (
        queries.dim(0),
        queries.dim(1),
        queries.dim(2),
        queries.dim(3),
    );
    let keys_time = keys.dim(2);
    let flat = |x: &Storage| -> Result<Storage> {
        let mut y = x.alias();
        y.reshape(&[batch_size * num_heads, x.dim(2), head_dim])?;
        Ok(y)
    };

    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut scores = Storage::new(queries.device(), DataType::F32);
    ops::gemm(&flat(queries)?, &flat(keys)?, false, true, scale, 0.0, &mut scores)?;

    let mut weights = Storage::new(queries.device(), DataType::F32);
    ops::softmax(&scores, values_lengths, &mut weights)?;
    if let Some(attention) = attention_out {
        ops::copy(&weights, attention)?;
        attention.reshape(&[batch_size, num_heads, queries_time, keys_time])?;
    }

    ops::gemm(&weights, &flat(values)?, false, false, 1.0, 0.0, output)?;
    output.reshape(&[batch_size, num_heads, queries_time, head_dim])?;
    Ok(())
}

/// Pre-norm self-attention sublayer with a fused Q/K/V projection.
///
/// In a decoder the newly projected keys and values are appended to the
/// cache along the time axis and attention runs over the grown cache; no
/// length mask is needed there since future steps do not exist yet.
pub struct SelfAttention {
    layer_norm: LayerNorm,
    linear_in: Dense,
    linear_out: Dense,
    num_heads: usize,
}

impl SelfAttention {
    pub fn load(index: &VariableIndex, scope: &str, num_heads: usize) -> Result<SelfAttention> {
        Ok(SelfAttention {
            layer_norm: LayerNorm::load(index, &format!("{}/layer_norm", scope))?,
            linear_in: Dense::load(index, &format!("{}/linear_in", scope))?,
            linear_out: Dense::load(index, &format!("{}/linear_out", scope))?,
            num_heads,
        })
    }

    pub fn forward(
        &self,
        input: &Storage,
        lengths: Option<&Storage>,
        cache: Option<(&mut Option<Storage>, &mut Option<Storage>)>,
        output: &mut Storage,
    ) -> Result<()> {
        let depth = input.dim(2);

        let mut normed = Storage::new(input.device(), DataType::F32);
        self.layer_norm.forward(input, &mut normed)?;
        let mut fused = Storage::new(input.device(), DataType::F32);
        self.linear_in.forward(&normed, &mut fused)?;

        let mut parts = ops::split(&fused, &[depth, depth, depth], 2, false)?;
        let values = parts.pop().expect("split returned three parts");
        let keys = parts.pop().expect("split returned three parts");
        let queries = parts.pop().expect("split returned three parts");

        let queries = split_heads(&queries, self.num_heads)?;
        let mut keys = split_heads(&keys, self.num_heads)?;
        let mut values = split_heads(&values, self.num_heads)?;

        if let Some((cached_keys, cached_values)) = cache {
            if let Some(previous) = cached_keys.take() {
                let mut grown = Storage::new(input.device(), DataType::F32);
                ops::concat(&[&previous, &keys], 2, &mut grown)?;
                keys = grown;
            }
            if let Some(previous) = cached_values.take() {
                let mut grown = Storage::new(input.device(), DataType::F32);
                ops::concat(&[&previous, &values], 2, &mut grown)?;
                values = grown;
            }
            *cached_keys = Some(keys.alias());
            *cached_values = Some(values.alias());
        }

        let mut context = Storage::new(input.device(), DataType::F32);
        dot_product_attention(&queries, &keys, &values, lengths, &mut context, None)?;

        let combined = combine_heads(&context)?;
        let mut projected = Storage::new(input.device(), DataType::F32);
        self.linear_out.forward(&combined, &mut projected)?;
        ops::add(&projected, input, output)
    }
}

/// Pre-norm encoder-decoder attention sublayer.
///
/// Keys and values are projected from the encoder memory once, on the first
/// decoding step, and reused afterwards.
pub struct CrossAttention {
    layer_norm: LayerNorm,
    linear_query: Dense,
    linear_memory: Dense,
    linear_out: Dense,
    num_heads: usize,
}

impl CrossAttention {
    pub fn load(index: &VariableIndex, scope: &str, num_heads: usize) -> Result<CrossAttention> {
        Ok(CrossAttention {
            layer_norm: LayerNorm::load(index, &format!("{}/layer_norm", scope))?,
            linear_query: Dense::load(index, &format!("{}/linear_query", scope))?,
            linear_memory: Dense::load(index, &format!("{}/linear_memory", scope))?,
            linear_out: Dense::load(index, &format!("{}/linear_out", scope))?,
            num_heads,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        input: &Storage,
        memory: &Storage,
        memory_lengths: &Storage,
        cached_keys: &mut Option<Storage>,
        cached_values: &mut Option<Storage>,
        output: &mut Storage,
        attention: Option<&mut Storage>,
    ) -> Result<()> {
        let depth = input.dim(2);

        let mut normed = Storage::new(input.device(), DataType::F32);
        self.layer_norm.forward(input, &mut normed)?;
        let mut queries = Storage::new(input.device(), DataType::F32);
        self.linear_query.forward(&normed, &mut queries)?;
        let queries = split_heads(&queries, self.num_heads)?;

        if cached_keys.is_none() {
            let mut fused = Storage::new(input.device(), DataType::F32);
            self.linear_memory.forward(memory, &mut fused)?;
            let mut parts = ops::split(&fused, &[depth, depth], 2, false)?;
            let values = parts.pop().expect("split returned two parts");
            let keys = parts.pop().expect("split returned two parts");
            *cached_keys = Some(split_heads(&keys, self.num_heads)?);
            *cached_values = Some(split_heads(&values, self.num_heads)?);
        }
        let keys = cached_keys.as_ref().expect("memory keys are projected");
        let values = cached_values.as_ref().expect("memory values are projected");

        let mut context = Storage::new(input.device(), DataType::F32);
        dot_product_attention(
            &queries,
            keys,
            values,
            Some(memory_lengths),
            &mut context,
            attention,
        )?;

        let combined = combine_heads(&context)?;
        let mut projected = Storage::new(input.device(), DataType::F32);
        self.linear_out.forward(&combined, &mut projected)?;
        ops::add(&projected, input, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn split_and_combine_heads_round_trip() {
        let x = Storage::from_vec((0..24).map(|v| v as f32).collect(), &[2, 3, 4]).unwrap();
        let split = split_heads(&x, 2).unwrap();
        assert_eq!(split.shape(), &[2, 2, 3, 2]);
        let combined = combine_heads(&split).unwrap();
        assert_eq!(combined.shape(), &[2, 3, 4]);
        assert_eq!(
            combined.to_vec::<f32>().unwrap(),
            x.to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn masked_positions_receive_no_attention() {
        // One batch, one head, one query over 4 keys, 2 of them masked.
        let queries = Storage::from_vec(vec![1.0f32, 0.0], &[1, 1, 1, 2]).unwrap();
        let keys = Storage::from_vec(
            vec![1.0f32, 0.0, 0.5, 0.5, 9.0, 9.0, 9.0, 9.0],
            &[1, 1, 4, 2],
        )
        .unwrap();
        let values = Storage::from_vec(
            vec![1.0f32, 1.0, 2.0, 2.0, 100.0, 100.0, 100.0, 100.0],
            &[1, 1, 4, 2],
        )
        .unwrap();
        let lengths = Storage::from_vec(vec![2i32], &[1]).unwrap();

        let mut output = Storage::new(Device::Cpu, DataType::F32);
        let mut attention = Storage::new(Device::Cpu, DataType::F32);
        dot_product_attention(
            &queries,
            &keys,
            &values,
            Some(&lengths),
            &mut output,
            Some(&mut attention),
        )
        .unwrap();

        let weights = attention.to_vec::<f32>().unwrap();
        assert_eq!(weights[2], 0.0);
        assert_eq!(weights[3], 0.0);
        assert!((weights[0] + weights[1] - 1.0).abs() < 1e-5);
        // The masked values (100.0) cannot leak into the context.
        assert!(output.to_vec::<f32>().unwrap().iter().all(|&v| v < 3.0));
    }
}
