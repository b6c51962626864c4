//! Per-row top-k selection

use super::{check_device, check_dtype};
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::DataType;

/// Selects the `k` largest values of each row of `input[…, depth]`.
///
/// Values come out in descending order; ties resolve to the lower index.
pub fn topk(input: &Storage, k: usize, values: &mut Storage, indices: &mut Storage) -> Result<()> {
    check_device("topk", input)?;
    check_dtype("topk", input, DataType::F32)?;
    let depth = input.dim(-1);
    if k == 0 || k > depth {
        return Err(Error::precondition(format!(
            "topk of {} from rows of {} elements",
            k, depth
        )));
    }
    let rows = input.size() / depth;
    let mut out_shape = input.shape().to_vec();
    *out_shape.last_mut().expect("input has rank >= 1") = k;
    values.resize(&out_shape)?;
    indices.resize(&out_shape)?;

    let in_data = input.data::<f32>()?.to_vec();
    {
        let val_data = values.data_mut::<f32>()?;
        let idx_data = indices.data_mut::<i32>()?;
        let mut order: Vec<usize> = Vec::with_capacity(depth);
        for row in 0..rows {
            let x = &in_data[row * depth..(row + 1) * depth];
            order.clear();
            order.extend(0..depth);
            order.select_nth_unstable_by(k - 1, |&a, &b| {
                x[b].total_cmp(&x[a]).then(a.cmp(&b))
            });
            order[..k].sort_unstable_by(|&a, &b| x[b].total_cmp(&x[a]).then(a.cmp(&b)));
            for j in 0..k {
                val_data[row * k + j] = x[order[j]];
                idx_data[row * k + j] = order[j] as i32;
            }
        }
    }
    Ok(())
}
