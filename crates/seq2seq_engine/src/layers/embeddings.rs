//! Embedding lookup scaled by sqrt(d_model)

use crate::error::Result;
use crate::model::VariableIndex;
use crate::ops;
use crate::storage::Storage;

pub struct ScaledEmbeddings {
    embeddings: Storage,
    scale: f32,
}

impl ScaledEmbeddings {
    pub fn load(index: &VariableIndex, scope: &str) -> Result<ScaledEmbeddings> {
        let embeddings = index.get(scope)?;
        let scale = (embeddings.dim(1) as f32).sqrt();
        Ok(ScaledEmbeddings { embeddings, scale })
    }

    pub fn depth(&self) -> usize {
        self.embeddings.dim(1)
    }

    /// `ids[B, T]` to `output[B, T, d]`.
    pub fn forward(&self, ids: &Storage, output: &mut Storage) -> Result<()> {
        ops::gather(&self.embeddings, ids, output)?;
        let scale = self.scale;
        for value in output.data_mut::<f32>()? {
            *value *= scale;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::types::DataType;

    #[test]
    fn gathers_and_scales_rows() {
        let mut index = VariableIndex::new();
        index.insert(
            "embeddings",
            Storage::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 4]).unwrap(),
        );
        let layer = ScaledEmbeddings::load(&index, "embeddings").unwrap();
        let ids = Storage::from_vec(vec![1i32, 0], &[1, 2]).unwrap();
        let mut output = Storage::new(Device::Cpu, DataType::F32);
        layer.forward(&ids, &mut output).unwrap();
        assert_eq!(output.shape(), &[1, 2, 4]);
        assert_eq!(output.at::<f32>(&[0, 0, 0]).unwrap(), 5.0 * 2.0);
        assert_eq!(output.at::<f32>(&[0, 1, 3]).unwrap(), 4.0 * 2.0);
    }
}
