//! Linear layer, float or quantized, with optional output restriction

use crate::device::Device;
use crate::error::{Error, Result};
use crate::model::VariableIndex;
use crate::ops;
use crate::storage::Storage;
use crate::types::DataType;

/// `output = input * weight^T + bias`, weight stored `[out, in]` row-major.
///
/// When the weight is quantized (i8 per-row scales, i16 single scale) the
/// input is quantized on the fly, the matmul runs in integers and the i32
/// accumulator is rescaled back to float before the bias add.
///
/// `set_vocabulary` gathers a subset of output rows once so that decoding
/// with a candidate list never projects over the full vocabulary.
pub struct Dense {
    weight: Storage,
    bias: Storage,
    weight_scale: Storage,
    partial_weight: Option<Storage>,
    partial_bias: Option<Storage>,
    partial_scale: Option<Storage>,
}

impl Dense {
    pub fn load(index: &VariableIndex, scope: &str) -> Result<Dense> {
        let weight = index.get(&format!("{}/weight", scope))?;
        let weight_scale = match index.get_if_exists(&format!("{}/weight_scale", scope)) {
            Some(scale) => scale,
            // Float weights have no companion; a unit scale keeps the
            // quantized code path uniform.
            None => Storage::from_vec(vec![1.0f32], &[1])?,
        };
        Ok(Dense {
            weight,
            bias: index.get(&format!("{}/bias", scope))?,
            weight_scale,
            partial_weight: None,
            partial_bias: None,
            partial_scale: None,
        })
    }

    /// Output depth currently produced (full or restricted).
    pub fn output_depth(&self) -> usize {
        match &self.partial_weight {
            Some(weight) => weight.dim(0),
            None => self.weight.dim(0),
        }
    }

    pub fn full_output_depth(&self) -> usize {
        self.weight.dim(0)
    }

    /// Restricts the output rows to `candidates` (an i32 index storage), or
    /// restores the full output when `candidates` is empty.
    pub fn set_vocabulary(&mut self, candidates: &Storage) -> Result<()> {
        if candidates.is_empty() {
            self.partial_weight = None;
            self.partial_bias = None;
            self.partial_scale = None;
            return Ok(());
        }
        let mut weight = Storage::new(self.weight.device(), self.weight.dtype());
        ops::gather(&self.weight, candidates, &mut weight)?;
        let mut bias = Storage::new(self.bias.device(), DataType::F32);
        ops::gather(&self.bias, candidates, &mut bias)?;
        self.partial_scale = if self.weight_scale.size() == self.weight.dim(0) {
            let mut scale = Storage::new(self.weight_scale.device(), DataType::F32);
            ops::gather(&self.weight_scale, candidates, &mut scale)?;
            Some(scale)
        } else {
            None
        };
        self.partial_weight = Some(weight);
        self.partial_bias = Some(bias);
        Ok(())
    }

    /// `input[…, in]` to `output[…, out]`.
    pub fn forward(&self, input: &Storage, output: &mut Storage) -> Result<()> {
        let weight = self.partial_weight.as_ref().unwrap_or(&self.weight);
        let bias = self.partial_bias.as_ref().unwrap_or(&self.bias);
        let scale = self
            .partial_scale
            .as_ref()
            .unwrap_or(&self.weight_scale);

        let in_depth = weight.dim(1);
        let out_depth = weight.dim(0);
        if input.dim(-1) != in_depth {
            return Err(Error::precondition(format!(
                "dense input of depth {} for weight of depth {}",
                input.dim(-1),
                in_depth
            )));
        }
        let rows = input.size() / in_depth;
        let mut input_2d = input.alias();
        input_2d.reshape(&[rows, in_depth])?;

        match weight.dtype() {
            DataType::F32 => {
                ops::gemm(&input_2d, weight, false, true, 1.0, 0.0, output)?;
            }
            DataType::I8 => {
                let mut qinput = Storage::new(Device::Cpu, DataType::I8);
                let mut input_scales = Storage::new(Device::Cpu, DataType::F32);
                ops::quantize_batch(&input_2d, &mut input_scales, &mut qinput)?;
                let mut acc = Storage::new(Device::Cpu, DataType::I32);
                ops::gemm(&qinput, weight, false, true, 1.0, 0.0, &mut acc)?;
                ops::rescale_output(&acc, &input_scales, scale, output)?;
            }
            DataType::I16 => {
                let fixed_scale = scale.at::<f32>(&[0])?;
                let mut qinput = Storage::new(Device::Cpu, DataType::I16);
                ops::quantize(&input_2d, &mut qinput, fixed_scale)?;
                let mut acc = Storage::new(Device::Cpu, DataType::I32);
                ops::gemm(&qinput, weight, false, true, 1.0, 0.0, &mut acc)?;
                let input_scales = Storage::from_vec(vec![fixed_scale; rows], &[rows])?;
                let weight_scales = Storage::from_vec(vec![fixed_scale; out_depth], &[out_depth])?;
                ops::rescale_output(&acc, &input_scales, &weight_scales, output)?;
            }
            dtype => return Err(Error::unsupported("dense", weight.device(), dtype)),
        }
        ops::add_depth_broadcast(bias, output)?;

        let mut out_shape = input.shape().to_vec();
        *out_shape.last_mut().expect("dense input has rank >= 1") = out_depth;
        output.reshape(&out_shape)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_index() -> VariableIndex {
        let mut index = VariableIndex::new();
        index.insert(
            "proj/weight",
            Storage::from_vec(vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]).unwrap(),
        );
        index.insert(
            "proj/bias",
            Storage::from_vec(vec![0.5f32, -0.5, 0.0], &[3]).unwrap(),
        );
        index
    }

    #[test]
    fn float_forward_with_bias() {
        let index = make_index();
        let dense = Dense::load(&index, "proj").unwrap();
        let input = Storage::from_vec(vec![2.0f32, 3.0], &[1, 1, 2]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        dense.forward(&input, &mut output).unwrap();
        assert_eq!(output.shape(), &[1, 1, 3]);
        assert_eq!(output.to_vec::<f32>().unwrap(), vec![2.5, 2.5, 5.0]);
    }

    #[test]
    fn vocabulary_restriction_gathers_rows() {
        let index = make_index();
        let mut dense = Dense::load(&index, "proj").unwrap();
        let candidates = Storage::from_vec(vec![2i32, 0], &[2]).unwrap();
        dense.set_vocabulary(&candidates).unwrap();
        assert_eq!(dense.output_depth(), 2);

        let input = Storage::from_vec(vec![2.0f32, 3.0], &[1, 2]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        dense.forward(&input, &mut output).unwrap();
        assert_eq!(output.to_vec::<f32>().unwrap(), vec![5.0, 2.5]);

        let empty = Storage::new(Device::Cpu, DataType::I32);
        dense.set_vocabulary(&empty).unwrap();
        assert_eq!(dense.output_depth(), 3);
    }

    #[test]
    fn int8_forward_tracks_float_within_tolerance() {
        let depth = 4;
        let out_depth = 3;
        let weight_f32: Vec<f32> = (0..12).map(|i| ((i as f32) - 6.0) / 7.0).collect();

        let mut float_index = VariableIndex::new();
        float_index.insert(
            "proj/weight",
            Storage::from_vec(weight_f32.clone(), &[out_depth, depth]).unwrap(),
        );
        float_index.insert(
            "proj/bias",
            Storage::from_vec(vec![0.1f32; out_depth], &[out_depth]).unwrap(),
        );

        // Quantize the weight per row with scale = 127 / amax.
        let mut qweight = vec![0i8; 12];
        let mut scales = vec![0.0f32; out_depth];
        crate::kernels::cpu::quantize_batch(&weight_f32, &mut scales, &mut qweight, depth);
        let mut int_index = VariableIndex::new();
        int_index.insert(
            "proj/weight",
            Storage::from_vec(qweight, &[out_depth, depth]).unwrap(),
        );
        int_index.insert(
            "proj/weight_scale",
            Storage::from_vec(scales, &[out_depth]).unwrap(),
        );
        int_index.insert(
            "proj/bias",
            Storage::from_vec(vec![0.1f32; out_depth], &[out_depth]).unwrap(),
        );

        let float_dense = Dense::load(&float_index, "proj").unwrap();
        let int_dense = Dense::load(&int_index, "proj").unwrap();
        let input = Storage::from_vec(vec![0.9f32, -0.3, 0.5, 0.2], &[1, depth]).unwrap();

        let mut float_out = Storage::new(Device::Cpu, DataType::F32);
        let mut int_out = Storage::new(Device::Cpu, DataType::F32);
        float_dense.forward(&input, &mut float_out).unwrap();
        int_dense.forward(&input, &mut int_out).unwrap();

        for (a, b) in float_out
            .to_vec::<f32>()
            .unwrap()
            .iter()
            .zip(int_out.to_vec::<f32>().unwrap())
        {
            assert!((a - b).abs() < 5e-2, "{} vs {}", a, b);
        }
    }
}
