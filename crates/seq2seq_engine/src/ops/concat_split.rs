//! Concat and split along an arbitrary axis
//!
//! Split supports a no-copy mode on axis 0 that returns aliased views into
//! the input buffer.

use super::check_device;
use crate::error::{Error, Result};
use crate::kernels::cpu;
use crate::storage::Storage;
use crate::types::DataType;

/// Concatenates `inputs` along `axis` into `output`.
pub fn concat(inputs: &[&Storage], axis: isize, output: &mut Storage) -> Result<()> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::precondition("concat of zero inputs"))?;
    check_device("concat", first)?;
    if first.dtype() != DataType::F32 {
        return Err(Error::unsupported("concat", first.device(), first.dtype()));
    }
    let axis = first.resolve_axis(axis);

    let mut out_shape = first.shape().to_vec();
    for input in &inputs[1..] {
        if input.rank() != first.rank() || input.dtype() != first.dtype() {
            return Err(Error::precondition("concat inputs must agree on rank and dtype"));
        }
        for (dim, (&a, &b)) in first.shape().iter().zip(input.shape()).enumerate() {
            if dim != axis && a != b {
                return Err(Error::precondition(format!(
                    "concat inputs disagree on dimension {}: {} vs {}",
                    dim, a, b
                )));
            }
        }
        out_shape[axis] += input.dim(axis as isize);
    }
    output.resize(&out_shape)?;

    let out_axis_stride = out_shape[axis..].iter().product::<usize>();
    let out_data = output.data_mut::<f32>()?;
    let mut offset = 0;
    for input in inputs {
        let iter_dim: usize = input.shape()[..axis].iter().product();
        let copy_dim: usize = input.shape()[axis..].iter().product();
        if copy_dim == 0 {
            continue;
        }
        let in_data = input.data::<f32>()?;
        for i in 0..iter_dim {
            cpu::copy(
                &in_data[i * copy_dim..(i + 1) * copy_dim],
                &mut out_data[offset + i * out_axis_stride..offset + i * out_axis_stride + copy_dim],
            );
        }
        offset += copy_dim;
    }
    Ok(())
}

/// Splits `input` into parts of `sizes` along `axis`.
///
/// With `no_copy` (axis 0 only) the returned storages are views aliasing
/// the input buffer.
pub fn split(input: &Storage, sizes: &[usize], axis: isize, no_copy: bool) -> Result<Vec<Storage>> {
    check_device("split", input)?;
    if input.dtype() != DataType::F32 {
        return Err(Error::unsupported("split", input.device(), input.dtype()));
    }
    let axis = input.resolve_axis(axis);
    if no_copy && axis != 0 {
        return Err(Error::precondition(
            "no-copy split is only defined on the first axis",
        ));
    }
    let total: usize = sizes.iter().sum();
    if total != input.shape()[axis] {
        return Err(Error::precondition(format!(
            "split sizes {:?} do not cover dimension {} of {:?}",
            sizes, axis, input.shape()
        )));
    }

    let mut outputs = Vec::with_capacity(sizes.len());
    if no_copy {
        let row_stride = input.stride(0);
        let mut offset = 0;
        for &size in sizes {
            let mut shape = input.shape().to_vec();
            shape[0] = size;
            outputs.push(Storage::view_of(input, offset, &shape)?);
            offset += size * row_stride;
        }
        return Ok(outputs);
    }

    let in_axis_stride = input.shape()[axis..].iter().product::<usize>();
    let iter_dim: usize = input.shape()[..axis].iter().product();
    let in_data = input.data::<f32>()?;
    let mut offset = 0;
    for &size in sizes {
        let mut shape = input.shape().to_vec();
        shape[axis] = size;
        let mut part = Storage::zeros(input.device(), input.dtype(), &shape);
        let copy_dim: usize = shape[axis..].iter().product();
        {
            let part_data = part.data_mut::<f32>()?;
            for i in 0..iter_dim {
                cpu::copy(
                    &in_data[offset + i * in_axis_stride..offset + i * in_axis_stride + copy_dim],
                    &mut part_data[i * copy_dim..(i + 1) * copy_dim],
                );
            }
        }
        offset += copy_dim;
        outputs.push(part);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn concat_of_split_is_identity() {
        let input = Storage::from_vec((0..12).map(|v| v as f32).collect(), &[2, 6]).unwrap();
        let parts = split(&input, &[2, 4], 1, false).unwrap();
        assert_eq!(parts[0].shape(), &[2, 2]);
        assert_eq!(parts[1].shape(), &[2, 4]);

        let mut output = Storage::new(Device::Cpu, DataType::F32);
        let refs: Vec<&Storage> = parts.iter().collect();
        concat(&refs, 1, &mut output).unwrap();
        assert_eq!(output.shape(), input.shape());
        assert_eq!(
            output.to_vec::<f32>().unwrap(),
            input.to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn no_copy_split_aliases_the_input() {
        let input = Storage::from_vec((0..6).map(|v| v as f32).collect(), &[3, 2]).unwrap();
        let parts = split(&input, &[1, 2], 0, true).unwrap();
        assert!(!parts[1].owning());
        assert_eq!(parts[1].at::<f32>(&[0, 0]).unwrap(), 2.0);
        assert_eq!(parts[1].at::<f32>(&[1, 1]).unwrap(), 5.0);
    }

    #[test]
    fn no_copy_split_requires_axis_zero() {
        let input = Storage::from_vec(vec![0.0f32; 6], &[3, 2]).unwrap();
        assert!(split(&input, &[1, 1], 1, true).is_err());
    }

    #[test]
    fn concat_axis_zero() {
        let a = Storage::from_vec(vec![1.0f32, 2.0], &[1, 2]).unwrap();
        let b = Storage::from_vec(vec![3.0f32, 4.0], &[1, 2]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        concat(&[&a, &b], 0, &mut output).unwrap();
        assert_eq!(output.shape(), &[2, 2]);
        assert_eq!(output.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
