//! Sinusoidal position encoding
//!
//! The table is owned by the graph instance and grown through `&mut self`,
//! so concurrent translators never share a lazily-grown buffer. Decoding
//! precomputes through the maximum decoding length before stepping.

use crate::error::{Error, Result};
use crate::storage::Storage;

pub struct PositionEncoder {
    depth: usize,
    table: Vec<f32>, // [max_length, depth] row-major
    max_length: usize,
}

impl PositionEncoder {
    pub fn new(depth: usize) -> Result<PositionEncoder> {
        if depth % 2 != 0 {
            return Err(Error::precondition(format!(
                "position encoding requires an even depth, got {}",
                depth
            )));
        }
        Ok(PositionEncoder {
            depth,
            table: Vec::new(),
            max_length: 0,
        })
    }

    /// Extends the table so positions `0..length` are available.
    pub fn reserve(&mut self, length: usize) {
        if length <= self.max_length {
            return;
        }
        self.table.reserve((length - self.max_length) * self.depth);
        for pos in self.max_length..length {
            for i in 0..self.depth / 2 {
                let rate = 10000f32.powf(-((2 * i) as f32) / self.depth as f32);
                let angle = pos as f32 * rate;
                self.table.push(angle.sin());
                self.table.push(angle.cos());
            }
        }
        self.max_length = length;
    }

    /// Adds `PE[offset + t]` to every batch entry of `input[B, T, d]`, in
    /// place. `offset` is the decoding step for step-wise decoders.
    pub fn forward(&mut self, input: &mut Storage, offset: usize) -> Result<()> {
        let (batch_size, time) = (input.dim(0), input.dim(1));
        if input.dim(2) != self.depth {
            return Err(Error::precondition(format!(
                "position encoding depth {} for input of depth {}",
                self.depth,
                input.dim(2)
            )));
        }
        self.reserve(offset + time);
        let encodings = &self.table[offset * self.depth..(offset + time) * self.depth];
        let data = input.data_mut::<f32>()?;
        for b in 0..batch_size {
            let row = &mut data[b * time * self.depth..(b + 1) * time * self.depth];
            for (value, encoding) in row.iter_mut().zip(encodings) {
                *value += encoding;
            }
        }
        Ok(())
    }
}
