//! Gather rows by integer indices along axis 0

use super::{check_device, check_dtype};
use crate::error::{Error, Result};
use crate::kernels::cpu;
use crate::storage::Storage;
use crate::types::DataType;

/// `output[i, …] = input[indices[i], …]`.
///
/// The output shape is the indices shape followed by the trailing input
/// dimensions, so gathering `[V, d]` embeddings with `[B, T]` ids yields
/// `[B, T, d]`.
pub fn gather(input: &Storage, indices: &Storage, output: &mut Storage) -> Result<()> {
    check_device("gather", input)?;
    check_dtype("gather", indices, DataType::I32)?;
    if input.rank() == 0 {
        return Err(Error::precondition("gather from a scalar storage"));
    }

    let row_size = input.stride(0);
    let num_rows = input.dim(0);
    let mut out_shape = indices.shape().to_vec();
    out_shape.extend_from_slice(&input.shape()[1..]);
    output.resize(&out_shape)?;

    let ids = indices.data::<i32>()?.to_vec();
    for &id in &ids {
        if id < 0 || id as usize >= num_rows {
            return Err(Error::precondition(format!(
                "gather index {} out of range for {} rows",
                id, num_rows
            )));
        }
    }

    macro_rules! gather_rows {
        ($ty:ty) => {{
            let in_data = input.data::<$ty>()?.to_vec();
            let out_data = output.data_mut::<$ty>()?;
            for (i, &id) in ids.iter().enumerate() {
                let row = id as usize;
                cpu::copy(
                    &in_data[row * row_size..(row + 1) * row_size],
                    &mut out_data[i * row_size..(i + 1) * row_size],
                );
            }
        }};
    }
    match input.dtype() {
        DataType::F32 => gather_rows!(f32),
        DataType::I32 => gather_rows!(i32),
        DataType::I8 => gather_rows!(i8),
        DataType::I16 => gather_rows!(i16),
        dtype => return Err(Error::unsupported("gather", input.device(), dtype)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn gathers_rows_in_index_order() {
        let input =
            Storage::from_vec(vec![0.0f32, 0.1, 1.0, 1.1, 2.0, 2.1], &[3, 2]).unwrap();
        let indices = Storage::from_vec(vec![2i32, 0, 2], &[3]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        gather(&input, &indices, &mut output).unwrap();
        assert_eq!(output.shape(), &[3, 2]);
        assert_eq!(
            output.to_vec::<f32>().unwrap(),
            vec![2.0, 2.1, 0.0, 0.1, 2.0, 2.1]
        );
    }

    #[test]
    fn multi_dim_indices_extend_the_shape() {
        let input = Storage::from_vec(vec![1.0f32, 2.0, 3.0], &[3, 1]).unwrap();
        let indices = Storage::from_vec(vec![0i32, 1, 2, 0], &[2, 2]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        gather(&input, &indices, &mut output).unwrap();
        assert_eq!(output.shape(), &[2, 2, 1]);
    }

    #[test]
    fn out_of_range_index_rejected() {
        let input = Storage::from_vec(vec![1.0f32, 2.0], &[2, 1]).unwrap();
        let indices = Storage::from_vec(vec![5i32], &[1]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        assert!(gather(&input, &indices, &mut output).is_err());
    }
}
