//! Primitive op library
//!
//! Storage-level operations dispatched on (device, dtype). Every entry point
//! validates shapes and dtypes before touching a kernel; combinations
//! without a kernel fail with `Error::Unsupported`.

mod concat_split;
mod elementwise;
mod gather;
mod gemm;
mod layer_norm;
mod multinomial;
mod shape;
mod softmax;
mod topk;
mod transpose;

pub use concat_split::{concat, split};
pub use elementwise::{
    add, add_depth_broadcast, amax, argmax, copy, cos, exp, fill, inv, log, max, mean, mul,
    mul_scalar, pow, quantize, quantize_batch, relu, rescale_output, sin, sub, sum, tanh,
    unquantize,
};
pub use gather::gather;
pub use gemm::gemm;
pub use layer_norm::layer_norm;
pub use multinomial::multinomial;
pub use shape::{squeeze, unsqueeze};
pub use softmax::{log_softmax, softmax};
pub use topk::topk;
pub use transpose::transpose;

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::DataType;

/// Rejects non-CPU storages for ops that only have CPU kernels in this
/// build.
pub(crate) fn check_device(op: &'static str, storage: &Storage) -> Result<()> {
    match storage.device() {
        crate::device::Device::Cpu => Ok(()),
        device => Err(Error::unsupported(op, device, storage.dtype())),
    }
}

pub(crate) fn check_dtype(op: &'static str, storage: &Storage, dtype: DataType) -> Result<()> {
    if storage.dtype() != dtype {
        return Err(Error::unsupported(op, storage.device(), storage.dtype()));
    }
    Ok(())
}

pub(crate) fn check_same_shape(op: &'static str, a: &Storage, b: &Storage) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::precondition(format!(
            "{}: shape mismatch between {:?} and {:?}",
            op,
            a.shape(),
            b.shape()
        )));
    }
    Ok(())
}
