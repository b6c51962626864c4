//! GEMM over storages, with an iterated batch variant for rank-3 inputs

use super::check_device;
use crate::error::{Error, Result};
use crate::kernels::cpu;
use crate::storage::Storage;
use crate::types::DataType;

/// `c = alpha * op(a) * op(b) + beta * c`.
///
/// Rank-2 inputs run a single GEMM; rank-3 inputs iterate over the leading
/// batch dimension. Supported dtype pairs: (f32, f32) -> f32,
/// (i8, i8) -> i32 and (i16, i16) -> i32.
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    a: &Storage,
    b: &Storage,
    transpose_a: bool,
    transpose_b: bool,
    alpha: f32,
    beta: f32,
    c: &mut Storage,
) -> Result<()> {
    check_device("gemm", a)?;
    check_device("gemm", b)?;
    if a.rank() != b.rank() || (a.rank() != 2 && a.rank() != 3) {
        return Err(Error::precondition(format!(
            "gemm expects two rank-2 or rank-3 inputs, got {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    if a.dtype() != b.dtype() {
        return Err(Error::unsupported("gemm", b.device(), b.dtype()));
    }

    let batch_size = if a.rank() == 3 {
        if a.dim(0) != b.dim(0) {
            return Err(Error::precondition(format!(
                "gemm batch mismatch: {:?} vs {:?}",
                a.shape(),
                b.shape()
            )));
        }
        a.dim(0)
    } else {
        1
    };

    let (m, k_a) = if transpose_a {
        (a.dim(-1), a.dim(-2))
    } else {
        (a.dim(-2), a.dim(-1))
    };
    let (k_b, n) = if transpose_b {
        (b.dim(-1), b.dim(-2))
    } else {
        (b.dim(-2), b.dim(-1))
    };
    if k_a != k_b {
        return Err(Error::precondition(format!(
            "gemm inner dimension mismatch: {} vs {}",
            k_a, k_b
        )));
    }

    let c_shape: Vec<usize> = if a.rank() == 3 {
        vec![batch_size, m, n]
    } else {
        vec![m, n]
    };
    if beta != 0.0 {
        if c.shape() != c_shape.as_slice() {
            return Err(Error::precondition(
                "gemm with beta != 0 requires a pre-shaped output",
            ));
        }
    } else {
        c.resize(&c_shape)?;
    }

    match (a.dtype(), c.dtype()) {
        (DataType::F32, DataType::F32) => cpu::gemm_batch(
            a.data::<f32>()?,
            b.data::<f32>()?,
            transpose_a,
            transpose_b,
            batch_size,
            m,
            n,
            k_a,
            alpha,
            beta,
            c.data_mut::<f32>()?,
        ),
        (DataType::I8, DataType::I32) => cpu::gemm_batch(
            a.data::<i8>()?,
            b.data::<i8>()?,
            transpose_a,
            transpose_b,
            batch_size,
            m,
            n,
            k_a,
            alpha,
            beta,
            c.data_mut::<i32>()?,
        ),
        (DataType::I16, DataType::I32) => cpu::gemm_batch(
            a.data::<i16>()?,
            b.data::<i16>()?,
            transpose_a,
            transpose_b,
            batch_size,
            m,
            n,
            k_a,
            alpha,
            beta,
            c.data_mut::<i32>()?,
        ),
        (dtype, _) => return Err(Error::unsupported("gemm", a.device(), dtype)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn batched_gemm() {
        // Two batches of [1, 2] x [2, 1].
        let a = Storage::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 1, 2]).unwrap();
        let b = Storage::from_vec(vec![1.0f32, 1.0, 2.0, 2.0], &[2, 2, 1]).unwrap();
        let mut c = Storage::new(Device::Cpu, DataType::F32);
        gemm(&a, &b, false, false, 1.0, 0.0, &mut c).unwrap();
        assert_eq!(c.shape(), &[2, 1, 1]);
        assert_eq!(c.to_vec::<f32>().unwrap(), vec![3.0, 14.0]);
    }

    #[test]
    fn mismatched_inner_dims_rejected() {
        let a = Storage::from_vec(vec![1.0f32; 6], &[2, 3]).unwrap();
        let b = Storage::from_vec(vec![1.0f32; 8], &[4, 2]).unwrap();
        let mut c = Storage::new(Device::Cpu, DataType::F32);
        assert!(gemm(&a, &b, false, false, 1.0, 0.0, &mut c).is_err());
    }

    #[test]
    fn int8_gemm_produces_i32() {
        let a = Storage::from_vec(vec![1i8, 2, 3, 4], &[2, 2]).unwrap();
        let b = Storage::from_vec(vec![1i8, 0, 0, 1], &[2, 2]).unwrap();
        let mut c = Storage::new(Device::Cpu, DataType::I32);
        gemm(&a, &b, false, false, 1.0, 0.0, &mut c).unwrap();
        assert_eq!(c.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
    }
}
