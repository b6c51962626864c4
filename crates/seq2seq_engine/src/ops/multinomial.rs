//! Multinomial sampling from per-row probability distributions

use rand::Rng;

use super::{check_device, check_dtype};
use crate::error::{Error, Result};
use crate::random::with_random_generator;
use crate::storage::Storage;
use crate::types::DataType;

/// Draws `sample_size` class indices per row of the probability matrix
/// `input[…, class_size]`.
///
/// Sampling uses inverse-CDF draws on the normalized cumulative
/// distribution. Without replacement, the drawn index's mass is removed and
/// the distribution renormalized before the next draw, so the indices of a
/// row are pairwise distinct.
pub fn multinomial(
    input: &Storage,
    sample_size: usize,
    replacement: bool,
    output: &mut Storage,
) -> Result<()> {
    check_device("multinomial", input)?;
    check_dtype("multinomial", input, DataType::F32)?;
    let class_size = input.dim(-1);
    if sample_size == 0 {
        return Err(Error::precondition("multinomial with sample_size = 0"));
    }
    if !replacement && sample_size > class_size {
        return Err(Error::precondition(format!(
            "sampling {} distinct classes out of {}",
            sample_size, class_size
        )));
    }
    let batch_size = input.size() / class_size;
    let mut out_shape = input.shape().to_vec();
    *out_shape.last_mut().expect("input has rank >= 1") = sample_size;
    output.resize(&out_shape)?;

    let in_data = input.data::<f32>()?.to_vec();
    let out_data = output.data_mut::<i32>()?;
    let mut cum_dist = vec![0.0f32; class_size];

    with_random_generator(|rng| {
        for i in 0..batch_size {
            let row = &in_data[i * class_size..(i + 1) * class_size];

            // Normalized cumulative distribution of the row.
            let mut running = 0.0;
            for (j, &p) in row.iter().enumerate() {
                running += p;
                cum_dist[j] = running;
            }
            if running <= 0.0 {
                return Err(Error::precondition(
                    "multinomial row has no probability mass",
                ));
            }
            for value in cum_dist.iter_mut() {
                *value /= running;
            }

            let out = &mut out_data[i * sample_size..(i + 1) * sample_size];
            for j in 0..sample_size {
                let uniform_sample: f32 = rng.gen();
                let index = cum_dist
                    .partition_point(|&cumulative| cumulative < uniform_sample)
                    .min(class_size - 1);
                out[j] = index as i32;

                if !replacement && j + 1 < sample_size {
                    // Remove the selected mass and renormalize.
                    let mass =
                        cum_dist[index] - if index > 0 { cum_dist[index - 1] } else { 0.0 };
                    for value in cum_dist[index..].iter_mut() {
                        *value -= mass;
                    }
                    let new_sum = 1.0 - mass;
                    for value in cum_dist.iter_mut() {
                        *value /= new_sum;
                    }
                }
            }
        }
        Ok(())
    })
}
