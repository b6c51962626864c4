//! Numerically stable softmax and log-softmax over the last axis

use super::{check_device, check_dtype};
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::DataType;

/// Softmax over the last axis.
///
/// When `lengths` is given, each batch entry masks key positions at or past
/// its length: those positions are exactly 0 in the output and the
/// remaining positions renormalize to 1. Rows are grouped evenly over the
/// batch entries (`rows / lengths.size()` rows per entry).
pub fn softmax(input: &Storage, lengths: Option<&Storage>, output: &mut Storage) -> Result<()> {
    check_device("softmax", input)?;
    check_dtype("softmax", input, DataType::F32)?;
    let depth = input.dim(-1);
    let rows = input.size() / depth;
    output.resize(input.shape())?;

    let row_lengths = match lengths {
        Some(lengths) => {
            check_dtype("softmax", lengths, DataType::I32)?;
            if rows % lengths.size() != 0 {
                return Err(Error::precondition(format!(
                    "softmax: {} rows cannot be grouped into {} batch entries",
                    rows,
                    lengths.size()
                )));
            }
            Some((lengths.data::<i32>()?.to_vec(), rows / lengths.size()))
        }
        None => None,
    };

    let in_data = input.data::<f32>()?.to_vec();
    let out_data = output.data_mut::<f32>()?;
    for row in 0..rows {
        let valid = match &row_lengths {
            Some((lengths, rows_per_batch)) => {
                (lengths[row / rows_per_batch] as usize).min(depth)
            }
            None => depth,
        };
        let x = &in_data[row * depth..row * depth + valid];
        let y = &mut out_data[row * depth..(row + 1) * depth];
        if valid == 0 {
            for value in y.iter_mut() {
                *value = 0.0;
            }
            continue;
        }
        let row_max = x.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let mut total = 0.0;
        for j in 0..valid {
            let e = (x[j] - row_max).exp();
            y[j] = e;
            total += e;
        }
        for value in y[..valid].iter_mut() {
            *value /= total;
        }
        for value in y[valid..].iter_mut() {
            *value = 0.0;
        }
    }
    Ok(())
}

/// Log-softmax over the last axis.
pub fn log_softmax(input: &Storage, output: &mut Storage) -> Result<()> {
    check_device("log_softmax", input)?;
    check_dtype("log_softmax", input, DataType::F32)?;
    let depth = input.dim(-1);
    let rows = input.size() / depth;
    output.resize(input.shape())?;

    let in_data = input.data::<f32>()?.to_vec();
    let out_data = output.data_mut::<f32>()?;
    for row in 0..rows {
        let x = &in_data[row * depth..(row + 1) * depth];
        let y = &mut out_data[row * depth..(row + 1) * depth];
        let row_max = x.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let log_sum: f32 = x.iter().map(|&v| (v - row_max).exp()).sum::<f32>().ln();
        for j in 0..depth {
            y[j] = x[j] - row_max - log_sum;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_sum_to_one_and_stay_positive() {
        let input =
            Storage::from_vec(vec![1.0f32, 2.0, 3.0, 1000.0, 1001.0, 1002.0], &[2, 3]).unwrap();
        let mut output = Storage::new(crate::device::Device::Cpu, DataType::F32);
        softmax(&input, None, &mut output).unwrap();
        let data = output.to_vec::<f32>().unwrap();
        for row in data.chunks(3) {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn masked_positions_are_exactly_zero() {
        let input = Storage::from_vec(vec![1.0f32; 8], &[2, 4]).unwrap();
        let lengths = Storage::from_vec(vec![2i32, 3], &[2]).unwrap();
        let mut output = Storage::new(crate::device::Device::Cpu, DataType::F32);
        softmax(&input, Some(&lengths), &mut output).unwrap();
        let data = output.to_vec::<f32>().unwrap();
        assert_eq!(data[2], 0.0);
        assert_eq!(data[3], 0.0);
        assert_eq!(data[7], 0.0);
        assert!((data[0] - 0.5).abs() < 1e-6);
        assert!((data[4] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn log_softmax_matches_log_of_softmax() {
        let input = Storage::from_vec(vec![0.5f32, -1.0, 2.0], &[1, 3]).unwrap();
        let mut soft = Storage::new(crate::device::Device::Cpu, DataType::F32);
        let mut log_soft = Storage::new(crate::device::Device::Cpu, DataType::F32);
        softmax(&input, None, &mut soft).unwrap();
        log_softmax(&input, &mut log_soft).unwrap();
        for (p, lp) in soft
            .to_vec::<f32>()
            .unwrap()
            .iter()
            .zip(log_soft.to_vec::<f32>().unwrap())
        {
            assert!((p.ln() - lp).abs() < 1e-5);
        }
    }
}
