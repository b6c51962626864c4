//! Squeeze and unsqueeze of unit axes

use crate::error::{Error, Result};
use crate::storage::Storage;

/// Removes the unit dimension `axis`.
pub fn squeeze(x: &mut Storage, axis: usize) -> Result<()> {
    if axis >= x.rank() {
        return Err(Error::precondition(format!(
            "squeeze axis {} out of range for rank {}",
            axis,
            x.rank()
        )));
    }
    if x.dim(axis as isize) != 1 {
        return Err(Error::precondition(format!(
            "cannot squeeze dimension {} of size {}",
            axis,
            x.dim(axis as isize)
        )));
    }
    let mut shape = x.shape().to_vec();
    shape.remove(axis);
    x.reshape(&shape)?;
    Ok(())
}

/// Inserts a unit dimension at `axis`.
pub fn unsqueeze(x: &mut Storage, axis: usize) -> Result<()> {
    if axis > x.rank() {
        return Err(Error::precondition(format!(
            "unsqueeze axis {} out of range for rank {}",
            axis,
            x.rank()
        )));
    }
    let mut shape = x.shape().to_vec();
    shape.insert(axis, 1);
    x.reshape(&shape)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squeeze_and_unsqueeze_round_trip() {
        let mut x = Storage::from_vec(vec![1.0f32, 2.0, 3.0], &[1, 3]).unwrap();
        squeeze(&mut x, 0).unwrap();
        assert_eq!(x.shape(), &[3]);
        unsqueeze(&mut x, 1).unwrap();
        assert_eq!(x.shape(), &[3, 1]);
    }

    #[test]
    fn squeeze_rejects_non_unit_axes() {
        let mut x = Storage::from_vec(vec![1.0f32, 2.0, 3.0], &[1, 3]).unwrap();
        assert!(squeeze(&mut x, 1).is_err());
    }
}
