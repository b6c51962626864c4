mod common;

use byteorder::{LittleEndian, WriteBytesExt};
use seq2seq_engine::model::save_model;
use seq2seq_engine::{ComputeType, Device, Error, Storage, TransformerModel};

#[test]
fn load_exposes_variables_and_layout() -> anyhow::Result<()> {
    let dir = common::write_model_dir();
    let model = TransformerModel::load(dir.path(), Device::Cpu, ComputeType::Default)?;

    assert_eq!(model.spec_revision(), 2);
    assert_eq!(model.effective_compute_type(), ComputeType::Default);
    let embeddings = model.variables().get("encoder/embeddings")?;
    assert_eq!(embeddings.shape(), &[common::TOKENS.len(), common::D_MODEL]);
    assert!(model
        .variables()
        .contains("decoder/layer_0/attention/linear_memory/weight"));
    Ok(())
}

#[test]
fn future_binary_version_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut file = std::fs::File::create(dir.path().join("model.bin"))?;
    file.write_u32::<LittleEndian>(u32::from_le_bytes(*b"S2SM"))?;
    file.write_u32::<LittleEndian>(3)?; // binary version above the current one
    file.write_u32::<LittleEndian>(1)?;
    file.write_u32::<LittleEndian>(0)?;
    drop(file);

    match TransformerModel::load(dir.path(), Device::Cpu, ComputeType::Default) {
        Err(Error::Configuration(message)) => {
            assert!(message.contains("binary version"), "{}", message);
        }
        other => panic!("expected a configuration error, got {:?}", other.err()),
    }
    Ok(())
}

#[test]
fn revision_one_kernel_names_are_upgraded() -> anyhow::Result<()> {
    let dir = common::write_model_dir();
    // Rewrite the weights file under the old naming convention.
    let variables = common::model_variables();
    let renamed: Vec<(String, &Storage)> = variables
        .iter()
        .map(|(name, storage)| {
            let name = match name.strip_suffix("/weight") {
                Some(stem) => format!("{}/kernel", stem),
                None => name.clone(),
            };
            (name, storage)
        })
        .collect();
    let refs: Vec<(&str, &Storage)> = renamed
        .iter()
        .map(|(name, storage)| (name.as_str(), *storage))
        .collect();
    save_model(dir.path().join("model.bin"), 1, &refs)?;

    let model = TransformerModel::load(dir.path(), Device::Cpu, ComputeType::Default)?;
    assert_eq!(model.spec_revision(), 1);
    assert!(model.variables().contains("decoder/projection/weight"));
    assert!(!model.variables().contains("decoder/projection/kernel"));
    Ok(())
}

#[test]
fn missing_scales_are_backfilled_with_ones() -> anyhow::Result<()> {
    let dir = common::write_model_dir();
    let mut variables = common::model_variables();
    for (name, storage) in variables.iter_mut() {
        if name.as_str() == "decoder/projection/weight" {
            let rows = storage.dim(0);
            let cols = storage.dim(1);
            let quantized: Vec<i8> = storage
                .data::<f32>()?
                .iter()
                .map(|&v| (v * 50.0) as i8)
                .collect();
            *storage = Storage::from_vec(quantized, &[rows, cols])?;
        }
    }
    let refs: Vec<(&str, &Storage)> = variables
        .iter()
        .map(|(name, storage)| (name.as_str(), storage))
        .collect();
    save_model(dir.path().join("model.bin"), 2, &refs)?;

    let model = TransformerModel::load(dir.path(), Device::Cpu, ComputeType::Default)?;
    let scale = model.variables().get("decoder/projection/weight_scale")?;
    assert_eq!(scale.size(), common::TOKENS.len());
    assert!(scale.to_vec::<f32>()?.iter().all(|&v| v == 1.0));
    Ok(())
}

#[test]
fn float_compute_type_dequantizes_weights() -> anyhow::Result<()> {
    let dir = common::write_model_dir();
    let model = TransformerModel::load(dir.path(), Device::Cpu, ComputeType::Int8)?;
    assert_eq!(model.effective_compute_type(), ComputeType::Int8);
    let weight = model.variables().get("decoder/projection/weight")?;
    assert_eq!(weight.dtype(), seq2seq_engine::DataType::I8);
    assert!(model.variables().contains("decoder/projection/weight_scale"));

    // The same directory loaded as float keeps float weights.
    let model = TransformerModel::load(dir.path(), Device::Cpu, ComputeType::Float)?;
    let weight = model.variables().get("decoder/projection/weight")?;
    assert_eq!(weight.dtype(), seq2seq_engine::DataType::F32);
    Ok(())
}
