//! Transpose for rank 2, 3 and 4 storages

use super::{check_device, check_dtype};
use crate::error::{Error, Result};
use crate::kernels::cpu;
use crate::storage::Storage;
use crate::types::DataType;

/// Permutes the axes of `input` into `output`.
pub fn transpose(input: &Storage, perm: &[usize], output: &mut Storage) -> Result<()> {
    check_device("transpose", input)?;
    check_dtype("transpose", input, DataType::F32)?;
    if perm.len() != input.rank() {
        return Err(Error::precondition(format!(
            "transpose: permutation {:?} for rank {}",
            perm,
            input.rank()
        )));
    }
    let mut seen = vec![false; perm.len()];
    for &axis in perm {
        if axis >= perm.len() || seen[axis] {
            return Err(Error::precondition(format!(
                "transpose: invalid permutation {:?}",
                perm
            )));
        }
        seen[axis] = true;
    }

    let in_shape = input.shape().to_vec();
    let out_shape: Vec<usize> = perm.iter().map(|&axis| in_shape[axis]).collect();
    output.resize(&out_shape)?;
    let in_data = input.data::<f32>()?.to_vec();
    let out_data = output.data_mut::<f32>()?;

    match input.rank() {
        2 => {
            if perm == [0, 1] {
                out_data.copy_from_slice(&in_data);
            } else {
                cpu::transpose_2d(&in_data, &[in_shape[0], in_shape[1]], out_data);
            }
        }
        3 => cpu::transpose_3d(
            &in_data,
            &[in_shape[0], in_shape[1], in_shape[2]],
            &[perm[0], perm[1], perm[2]],
            out_data,
        ),
        4 => cpu::transpose_4d(
            &in_data,
            &[in_shape[0], in_shape[1], in_shape[2], in_shape[3]],
            &[perm[0], perm[1], perm[2], perm[3]],
            out_data,
        ),
        rank => {
            return Err(Error::precondition(format!(
                "transpose supports rank 2 to 4, got {}",
                rank
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn transpose_2d() {
        let input = Storage::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        transpose(&input, &[1, 0], &mut output).unwrap();
        assert_eq!(output.shape(), &[3, 2]);
        assert_eq!(
            output.to_vec::<f32>().unwrap(),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
    }

    #[test]
    fn transpose_4d_head_split() {
        // [1, 2, 2, 2] -> [1, 2, 2, 2] with perm (0, 2, 1, 3), the
        // split-heads layout change.
        let input = Storage::from_vec((0..8).map(|v| v as f32).collect(), &[1, 2, 2, 2]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        transpose(&input, &[0, 2, 1, 3], &mut output).unwrap();
        assert_eq!(
            output.to_vec::<f32>().unwrap(),
            vec![0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]
        );
    }

    #[test]
    fn invalid_permutation_rejected() {
        let input = Storage::from_vec(vec![1.0f32; 4], &[2, 2]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        assert!(transpose(&input, &[0, 0], &mut output).is_err());
        assert!(transpose(&input, &[0], &mut output).is_err());
    }
}
