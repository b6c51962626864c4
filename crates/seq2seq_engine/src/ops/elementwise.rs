//! Fill, copy, reductions, elementwise and quantization ops

use super::{check_device, check_dtype, check_same_shape};
use crate::error::{Error, Result};
use crate::kernels::cpu;
use crate::storage::Storage;
use crate::types::DataType;

pub fn fill(x: &mut Storage, value: f32) -> Result<()> {
    check_device("fill", x)?;
    check_dtype("fill", x, DataType::F32)?;
    cpu::fill(x.data_mut::<f32>()?, value);
    Ok(())
}

/// Resizes `y` to the shape of `x` and copies the contents.
pub fn copy(x: &Storage, y: &mut Storage) -> Result<()> {
    check_device("copy", x)?;
    check_device("copy", y)?;
    y.resize(x.shape())?;
    match x.dtype() {
        DataType::F32 => cpu::copy(x.data::<f32>()?, y.data_mut::<f32>()?),
        DataType::I32 => cpu::copy(x.data::<i32>()?, y.data_mut::<i32>()?),
        DataType::I8 => cpu::copy(x.data::<i8>()?, y.data_mut::<i8>()?),
        DataType::I16 => cpu::copy(x.data::<i16>()?, y.data_mut::<i16>()?),
        dtype => return Err(Error::unsupported("copy", x.device(), dtype)),
    }
    Ok(())
}

pub fn sum(x: &Storage) -> Result<f32> {
    check_device("sum", x)?;
    check_dtype("sum", x, DataType::F32)?;
    Ok(cpu::sum(x.data::<f32>()?))
}

pub fn mean(x: &Storage) -> Result<f32> {
    check_device("mean", x)?;
    check_dtype("mean", x, DataType::F32)?;
    Ok(cpu::mean(x.data::<f32>()?))
}

pub fn max(x: &Storage) -> Result<f32> {
    check_device("max", x)?;
    check_dtype("max", x, DataType::F32)?;
    Ok(cpu::max(x.data::<f32>()?))
}

pub fn amax(x: &Storage) -> Result<f32> {
    check_device("amax", x)?;
    check_dtype("amax", x, DataType::F32)?;
    Ok(cpu::amax(x.data::<f32>()?))
}

/// Index of the maximum element over the flattened storage, lowest index on
/// ties.
pub fn argmax(x: &Storage) -> Result<usize> {
    check_device("argmax", x)?;
    check_dtype("argmax", x, DataType::F32)?;
    if x.is_empty() {
        return Err(Error::precondition("argmax of an empty storage"));
    }
    Ok(cpu::max_element(x.data::<f32>()?))
}

fn binary(
    op: &'static str,
    a: &Storage,
    b: &Storage,
    c: &mut Storage,
    kernel: fn(&[f32], &[f32], &mut [f32]),
) -> Result<()> {
    check_device(op, a)?;
    check_dtype(op, a, DataType::F32)?;
    check_dtype(op, b, DataType::F32)?;
    check_same_shape(op, a, b)?;
    c.resize(a.shape())?;
    kernel(a.data::<f32>()?, b.data::<f32>()?, c.data_mut::<f32>()?);
    Ok(())
}

pub fn add(a: &Storage, b: &Storage, c: &mut Storage) -> Result<()> {
    binary("add", a, b, c, cpu::add)
}

pub fn sub(a: &Storage, b: &Storage, c: &mut Storage) -> Result<()> {
    binary("sub", a, b, c, cpu::sub)
}

pub fn mul(a: &Storage, b: &Storage, c: &mut Storage) -> Result<()> {
    binary("mul", a, b, c, cpu::mul)
}

pub fn mul_scalar(a: f32, x: &Storage, y: &mut Storage) -> Result<()> {
    check_device("mul", x)?;
    check_dtype("mul", x, DataType::F32)?;
    y.resize(x.shape())?;
    cpu::mul_scalar(a, x.data::<f32>()?, y.data_mut::<f32>()?);
    Ok(())
}

fn unary(
    op: &'static str,
    x: &Storage,
    y: &mut Storage,
    f: impl Fn(f32) -> f32,
) -> Result<()> {
    check_device(op, x)?;
    check_dtype(op, x, DataType::F32)?;
    y.resize(x.shape())?;
    cpu::unary(x.data::<f32>()?, y.data_mut::<f32>()?, f);
    Ok(())
}

pub fn exp(x: &Storage, y: &mut Storage) -> Result<()> {
    unary("exp", x, y, f32::exp)
}

pub fn log(x: &Storage, y: &mut Storage) -> Result<()> {
    unary("log", x, y, f32::ln)
}

pub fn pow(x: &Storage, power: f32, y: &mut Storage) -> Result<()> {
    unary("pow", x, y, |v| v.powf(power))
}

pub fn sin(x: &Storage, y: &mut Storage) -> Result<()> {
    unary("sin", x, y, f32::sin)
}

pub fn cos(x: &Storage, y: &mut Storage) -> Result<()> {
    unary("cos", x, y, f32::cos)
}

pub fn tanh(x: &Storage, y: &mut Storage) -> Result<()> {
    unary("tanh", x, y, f32::tanh)
}

pub fn inv(x: &Storage, y: &mut Storage) -> Result<()> {
    check_device("inv", x)?;
    check_dtype("inv", x, DataType::F32)?;
    y.resize(x.shape())?;
    cpu::inv(x.data::<f32>()?, y.data_mut::<f32>()?);
    Ok(())
}

pub fn relu(x: &Storage, y: &mut Storage) -> Result<()> {
    check_device("relu", x)?;
    check_dtype("relu", x, DataType::F32)?;
    y.resize(x.shape())?;
    cpu::relu(x.data::<f32>()?, y.data_mut::<f32>()?);
    Ok(())
}

/// `b[i, j] += a[j]` over the last axis of `b`.
pub fn add_depth_broadcast(a: &Storage, b: &mut Storage) -> Result<()> {
    check_device("add_depth_broadcast", a)?;
    check_dtype("add_depth_broadcast", a, DataType::F32)?;
    check_dtype("add_depth_broadcast", b, DataType::F32)?;
    if b.size() % a.size() != 0 {
        return Err(Error::precondition(format!(
            "add_depth_broadcast: {} elements do not tile {}",
            a.size(),
            b.size()
        )));
    }
    let a_data = a.data::<f32>()?.to_vec();
    let b_data = b.data_mut::<f32>()?;
    let mut out = vec![0.0f32; b_data.len()];
    cpu::add_depth_broadcast(&a_data, b_data, &mut out);
    b_data.copy_from_slice(&out);
    Ok(())
}

/// `y = round(x * scale)` into an integer storage of the same shape.
pub fn quantize(x: &Storage, y: &mut Storage, scale: f32) -> Result<()> {
    check_device("quantize", x)?;
    check_dtype("quantize", x, DataType::F32)?;
    y.resize(x.shape())?;
    match y.dtype() {
        DataType::I8 => cpu::quantize(x.data::<f32>()?, y.data_mut::<i8>()?, scale),
        DataType::I16 => cpu::quantize(x.data::<f32>()?, y.data_mut::<i16>()?, scale),
        dtype => return Err(Error::unsupported("quantize", y.device(), dtype)),
    }
    Ok(())
}

/// `y = x / scale` back to float.
pub fn unquantize(x: &Storage, y: &mut Storage, scale: f32) -> Result<()> {
    check_device("unquantize", x)?;
    check_dtype("unquantize", y, DataType::F32)?;
    y.resize(x.shape())?;
    match x.dtype() {
        DataType::I8 => cpu::unquantize(x.data::<i8>()?, y.data_mut::<f32>()?, scale),
        DataType::I16 => cpu::unquantize(x.data::<i16>()?, y.data_mut::<f32>()?, scale),
        dtype => return Err(Error::unsupported("unquantize", x.device(), dtype)),
    }
    Ok(())
}

/// Per-row quantization of `x[…, depth]` to i8, producing one scale per row.
pub fn quantize_batch(x: &Storage, scales: &mut Storage, qx: &mut Storage) -> Result<()> {
    check_device("quantize_batch", x)?;
    check_dtype("quantize_batch", x, DataType::F32)?;
    check_dtype("quantize_batch", qx, DataType::I8)?;
    let depth = x.dim(-1);
    let batch_size = x.size() / depth;
    scales.resize(&[batch_size])?;
    qx.resize(x.shape())?;
    cpu::quantize_batch(
        x.data::<f32>()?,
        scales.data_mut::<f32>()?,
        qx.data_mut::<i8>()?,
        depth,
    );
    Ok(())
}

/// Rescales an i32 GEMM accumulator back to float by the outer product of
/// the input and weight scales.
pub fn rescale_output(
    x: &Storage,
    input_scales: &Storage,
    weight_scales: &Storage,
    y: &mut Storage,
) -> Result<()> {
    check_device("rescale_output", x)?;
    check_dtype("rescale_output", x, DataType::I32)?;
    check_dtype("rescale_output", input_scales, DataType::F32)?;
    check_dtype("rescale_output", weight_scales, DataType::F32)?;
    if x.size() != input_scales.size() * weight_scales.size() {
        return Err(Error::precondition(format!(
            "rescale_output: {} elements cannot be scaled by [{} x {}]",
            x.size(),
            input_scales.size(),
            weight_scales.size()
        )));
    }
    y.resize(x.shape())?;
    cpu::rescale_output(
        x.data::<i32>()?,
        input_scales.data::<f32>()?,
        weight_scales.data::<f32>()?,
        y.data_mut::<f32>()?,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elementwise_add_and_shape_check() {
        let a = Storage::from_vec(vec![1.0f32, 2.0], &[2]).unwrap();
        let b = Storage::from_vec(vec![3.0f32, 4.0], &[2]).unwrap();
        let mut c = Storage::new(crate::device::Device::Cpu, DataType::F32);
        add(&a, &b, &mut c).unwrap();
        assert_eq!(c.to_vec::<f32>().unwrap(), vec![4.0, 6.0]);

        let bad = Storage::from_vec(vec![1.0f32; 3], &[3]).unwrap();
        assert!(add(&a, &bad, &mut c).is_err());
    }

    #[test]
    fn quantize_round_trip() {
        let x = Storage::from_vec(vec![0.5f32, -0.25, 1.0, -1.0], &[4]).unwrap();
        let mut q = Storage::new(crate::device::Device::Cpu, DataType::I8);
        let mut back = Storage::new(crate::device::Device::Cpu, DataType::F32);
        quantize(&x, &mut q, 127.0).unwrap();
        unquantize(&q, &mut back, 127.0).unwrap();
        for (orig, restored) in x
            .to_vec::<f32>()
            .unwrap()
            .iter()
            .zip(back.to_vec::<f32>().unwrap())
        {
            assert!((orig - restored).abs() <= 1.0 / 127.0);
        }
    }

    #[test]
    fn unsupported_dtype_reports_op_and_pair() {
        let x = Storage::from_vec(vec![1i32, 2], &[2]).unwrap();
        match sum(&x) {
            Err(Error::Unsupported { op, dtype, .. }) => {
                assert_eq!(op, "sum");
                assert_eq!(dtype, DataType::I32);
            }
            other => panic!("expected Unsupported, got {:?}", other.err()),
        }
    }
}
