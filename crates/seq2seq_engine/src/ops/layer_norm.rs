//! Layer normalization over the last axis

use super::{check_device, check_dtype};
use crate::error::{Error, Result};
use crate::kernels::cpu;
use crate::storage::Storage;
use crate::types::DataType;

/// `(x - mean) / sqrt(var + epsilon) * gamma + beta`, per row of the last
/// axis.
pub fn layer_norm(
    gamma: &Storage,
    beta: &Storage,
    input: &Storage,
    output: &mut Storage,
    epsilon: f32,
) -> Result<()> {
    check_device("layer_norm", input)?;
    check_dtype("layer_norm", input, DataType::F32)?;
    check_dtype("layer_norm", gamma, DataType::F32)?;
    check_dtype("layer_norm", beta, DataType::F32)?;
    let depth = input.dim(-1);
    if gamma.size() != depth || beta.size() != depth {
        return Err(Error::precondition(format!(
            "layer_norm: gamma/beta of size {}/{} for depth {}",
            gamma.size(),
            beta.size(),
            depth
        )));
    }
    output.resize(input.shape())?;

    let rows = input.size() / depth;
    let in_data = input.data::<f32>()?.to_vec();
    let gamma_data = gamma.data::<f32>()?.to_vec();
    let beta_data = beta.data::<f32>()?.to_vec();
    let out_data = output.data_mut::<f32>()?;

    let mut normalized = vec![0.0f32; depth];
    for row in 0..rows {
        let x = &in_data[row * depth..(row + 1) * depth];
        let mean = cpu::mean(x);
        let mut variance = 0.0;
        for &value in x {
            variance += (value - mean) * (value - mean);
        }
        variance /= depth as f32;
        let inv_std = 1.0 / (variance + epsilon).sqrt();
        for j in 0..depth {
            normalized[j] = (x[j] - mean) * inv_std;
        }
        cpu::mul_and_add_batch_broadcast(
            &normalized,
            &gamma_data,
            &beta_data,
            &mut out_data[row * depth..(row + 1) * depth],
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_rows_have_zero_mean_unit_variance() {
        let depth = 8;
        let input: Vec<f32> = (0..16).map(|i| (i as f32) * 0.7 - 3.0).collect();
        let input = Storage::from_vec(input, &[2, depth]).unwrap();
        let gamma = Storage::from_vec(vec![1.0f32; depth], &[depth]).unwrap();
        let beta = Storage::from_vec(vec![0.0f32; depth], &[depth]).unwrap();
        let mut output = Storage::new(crate::device::Device::Cpu, DataType::F32);
        layer_norm(&gamma, &beta, &input, &mut output, 1e-6).unwrap();

        for row in output.to_vec::<f32>().unwrap().chunks(depth) {
            let mean: f32 = row.iter().sum::<f32>() / depth as f32;
            let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / depth as f32;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn gamma_and_beta_are_applied() {
        let input = Storage::from_vec(vec![1.0f32, 3.0], &[1, 2]).unwrap();
        let gamma = Storage::from_vec(vec![2.0f32, 2.0], &[2]).unwrap();
        let beta = Storage::from_vec(vec![1.0f32, -1.0], &[2]).unwrap();
        let mut output = Storage::new(crate::device::Device::Cpu, DataType::F32);
        layer_norm(&gamma, &beta, &input, &mut output, 1e-6).unwrap();
        let data = output.to_vec::<f32>().unwrap();
        // normalized row is [-1, 1]
        assert!((data[0] - (-1.0)).abs() < 1e-3);
        assert!((data[1] - 1.0).abs() < 1e-3);
    }
}
