//! Model loading, weight index and graph construction
//!
//! A model directory contains `model.bin` (the serialized weights), the
//! source and target vocabulary files and an optional vocabulary map. After
//! `finalize` the weight index is immutable; encoder and decoder graphs
//! hold non-owning aliases into it and can be built once per thread.

mod vocabulary;
mod vocabulary_map;

pub use vocabulary::{Vocabulary, BOS_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};
pub use vocabulary_map::VocabularyMap;

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use half::f16;
use tracing::{debug, info, warn};

use crate::device::{Device, ScopedDeviceSetter};
use crate::error::{Error, Result};
use crate::kernels::cpu;
use crate::layers::{Decoder, Encoder, TransformerDecoder, TransformerEncoder};
use crate::storage::Storage;
use crate::types::{ComputeType, DataType};

pub const CURRENT_BINARY_VERSION: u32 = 2;
pub const CURRENT_SPEC_REVISION: u32 = 2;

const MODEL_MAGIC: u32 = u32::from_le_bytes(*b"S2SM");
const WEIGHTS_FILE: &str = "model.bin";
const SOURCE_VOCABULARY_FILE: &str = "source_vocabulary.txt";
const TARGET_VOCABULARY_FILE: &str = "target_vocabulary.txt";
const VOCABULARY_MAP_FILE: &str = "vocabulary_map.txt";

// Fixed quantization multiplier for int16 weights.
const INT16_SCALE: f32 = 1000.0;

/// Name -> storage mapping populated at load time.
#[derive(Default)]
pub struct VariableIndex {
    variables: HashMap<String, Storage>,
}

impl VariableIndex {
    pub fn new() -> VariableIndex {
        VariableIndex::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, variable: Storage) {
        self.variables.insert(name.into(), variable);
    }

    pub fn remove(&mut self, name: &str) -> Option<Storage> {
        self.variables.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Non-owning alias of the named variable.
    pub fn get(&self, name: &str) -> Result<Storage> {
        self.get_if_exists(name)
            .ok_or_else(|| Error::precondition(format!("missing model variable: {}", name)))
    }

    pub fn get_if_exists(&self, name: &str) -> Option<Storage> {
        self.variables.get(name).map(Storage::alias)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }
}

/// A loaded model yielding fresh encoder/decoder graph instances that share
/// its weights.
pub trait SequenceToSequenceModel: Send + Sync {
    fn device(&self) -> Device;
    fn source_vocabulary(&self) -> &Vocabulary;
    fn target_vocabulary(&self) -> &Vocabulary;
    fn vocabulary_map(&self) -> Option<&VocabularyMap>;
    fn make_encoder(&self) -> Result<Box<dyn Encoder + Send>>;
    fn make_decoder(&self) -> Result<Box<dyn Decoder + Send>>;
}

pub struct TransformerModel {
    device: Device,
    effective_compute_type: ComputeType,
    variables: VariableIndex,
    source_vocabulary: Vocabulary,
    target_vocabulary: Vocabulary,
    vocabulary_map: Option<VocabularyMap>,
    spec_revision: u32,
    num_heads: usize,
    encoder_layers: usize,
    decoder_layers: usize,
}

impl TransformerModel {
    /// Loads a model directory onto `device` with the requested compute
    /// type.
    pub fn load(
        path: impl AsRef<Path>,
        device: Device,
        compute_type: ComputeType,
    ) -> Result<Arc<TransformerModel>> {
        let path = path.as_ref();
        device.validate()?;
        let _device_setter = ScopedDeviceSetter::new(device);
        info!(path = %path.display(), %device, "loading model");

        let (spec_revision, mut variables) = read_variables(&path.join(WEIGHTS_FILE))?;
        if spec_revision > CURRENT_SPEC_REVISION {
            return Err(Error::configuration(format!(
                "unsupported model spec revision {} (this engine supports up to {})",
                spec_revision, CURRENT_SPEC_REVISION
            )));
        }

        let source_vocabulary = Vocabulary::load(path.join(SOURCE_VOCABULARY_FILE))?;
        let target_vocabulary = Vocabulary::load(path.join(TARGET_VOCABULARY_FILE))?;
        let map_path = path.join(VOCABULARY_MAP_FILE);
        let vocabulary_map = if map_path.exists() {
            Some(VocabularyMap::load(map_path, &target_vocabulary)?)
        } else {
            None
        };

        let effective_compute_type = finalize(&mut variables, device, compute_type)?;

        let num_heads = match variables.get_if_exists("num_heads") {
            Some(heads) => heads.data::<i32>()?[0] as usize,
            None => 8,
        };
        let count_layers = |prefix: &str| {
            let mut count = 0;
            while variables.contains(&format!("{}/layer_{}/ffn/linear_1/weight", prefix, count)) {
                count += 1;
            }
            count
        };
        let encoder_layers = count_layers("encoder");
        let decoder_layers = count_layers("decoder");
        if encoder_layers == 0 || decoder_layers == 0 {
            return Err(Error::configuration(
                "model has no encoder or decoder layers",
            ));
        }
        debug!(
            spec_revision,
            num_heads, encoder_layers, decoder_layers, "model graph layout"
        );

        Ok(Arc::new(TransformerModel {
            device,
            effective_compute_type,
            variables,
            source_vocabulary,
            target_vocabulary,
            vocabulary_map,
            spec_revision,
            num_heads,
            encoder_layers,
            decoder_layers,
        }))
    }

    pub fn spec_revision(&self) -> u32 {
        self.spec_revision
    }

    /// Compute type actually in effect after hardware fallbacks.
    pub fn effective_compute_type(&self) -> ComputeType {
        self.effective_compute_type
    }

    pub fn get_scoped_device_setter(&self) -> ScopedDeviceSetter {
        ScopedDeviceSetter::new(self.device)
    }

    pub fn variables(&self) -> &VariableIndex {
        &self.variables
    }
}

impl SequenceToSequenceModel for TransformerModel {
    fn device(&self) -> Device {
        self.device
    }

    fn source_vocabulary(&self) -> &Vocabulary {
        &self.source_vocabulary
    }

    fn target_vocabulary(&self) -> &Vocabulary {
        &self.target_vocabulary
    }

    fn vocabulary_map(&self) -> Option<&VocabularyMap> {
        self.vocabulary_map.as_ref()
    }

    fn make_encoder(&self) -> Result<Box<dyn Encoder + Send>> {
        Ok(Box::new(TransformerEncoder::load(
            &self.variables,
            self.encoder_layers,
            self.num_heads,
        )?))
    }

    fn make_decoder(&self) -> Result<Box<dyn Decoder + Send>> {
        Ok(Box::new(TransformerDecoder::load(
            &self.variables,
            self.decoder_layers,
            self.num_heads,
        )?))
    }
}

/// Applies spec-revision fixups before a variable enters the index.
/// Revision 1 models name dense weights `…/kernel`.
fn register_variable(
    variables: &mut VariableIndex,
    spec_revision: u32,
    name: String,
    variable: Storage,
) {
    let name = if spec_revision < 2 {
        match name.strip_suffix("/kernel") {
            Some(stem) => format!("{}/weight", stem),
            None => name,
        }
    } else {
        name
    };
    variables.insert(name, variable);
}

fn read_variables(path: &Path) -> Result<(u32, VariableIndex)> {
    let file = std::fs::File::open(path).map_err(|err| {
        Error::configuration(format!("cannot open model {}: {}", path.display(), err))
    })?;
    // The weights file is typically the largest input by far; map it
    // instead of buffering it.
    let map = unsafe { memmap2::Mmap::map(&file)? };
    let mut reader = Cursor::new(&map[..]);

    if reader.read_u32::<LittleEndian>()? != MODEL_MAGIC {
        return Err(Error::configuration(format!(
            "{} is not a model file",
            path.display()
        )));
    }
    let binary_version = reader.read_u32::<LittleEndian>()?;
    if binary_version > CURRENT_BINARY_VERSION {
        return Err(Error::configuration(format!(
            "unsupported model binary version {} (this engine supports up to {})",
            binary_version, CURRENT_BINARY_VERSION
        )));
    }
    let spec_revision = reader.read_u32::<LittleEndian>()?;
    let num_variables = reader.read_u32::<LittleEndian>()?;

    let mut variables = VariableIndex::new();
    for _ in 0..num_variables {
        let name_length = reader.read_u16::<LittleEndian>()? as usize;
        let mut name_bytes = vec![0u8; name_length];
        reader.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| Error::configuration("variable name is not valid UTF-8".to_string()))?;

        let dtype = DataType::from_tag(reader.read_u8()?)
            .ok_or_else(|| Error::configuration(format!("unknown dtype tag for {}", name)))?;
        let rank = reader.read_u8()? as usize;
        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            shape.push(reader.read_u32::<LittleEndian>()? as usize);
        }
        let size: usize = shape.iter().product();

        let variable = match dtype {
            DataType::F32 => {
                let mut data = vec![0f32; size];
                reader.read_f32_into::<LittleEndian>(&mut data)?;
                Storage::from_vec(data, &shape)?
            }
            DataType::F16 => {
                let mut bits = vec![0u16; size];
                reader.read_u16_into::<LittleEndian>(&mut bits)?;
                let data: Vec<f16> = bits.into_iter().map(f16::from_bits).collect();
                Storage::from_vec(data, &shape)?
            }
            DataType::I8 => {
                let mut data = vec![0i8; size];
                reader.read_i8_into(&mut data)?;
                Storage::from_vec(data, &shape)?
            }
            DataType::I16 => {
                let mut data = vec![0i16; size];
                reader.read_i16_into::<LittleEndian>(&mut data)?;
                Storage::from_vec(data, &shape)?
            }
            DataType::I32 => {
                let mut data = vec![0i32; size];
                reader.read_i32_into::<LittleEndian>(&mut data)?;
                Storage::from_vec(data, &shape)?
            }
        };
        register_variable(&mut variables, spec_revision, name, variable);
    }
    Ok((spec_revision, variables))
}

/// Serializes variables in the engine's binary layout. Used by model
/// converters and the test suite.
pub fn save_model(
    path: impl AsRef<Path>,
    spec_revision: u32,
    variables: &[(&str, &Storage)],
) -> Result<()> {
    let mut writer = std::io::BufWriter::new(std::fs::File::create(path.as_ref())?);
    writer.write_u32::<LittleEndian>(MODEL_MAGIC)?;
    writer.write_u32::<LittleEndian>(CURRENT_BINARY_VERSION)?;
    writer.write_u32::<LittleEndian>(spec_revision)?;
    writer.write_u32::<LittleEndian>(variables.len() as u32)?;

    for (name, variable) in variables {
        writer.write_u16::<LittleEndian>(name.len() as u16)?;
        writer.write_all(name.as_bytes())?;
        writer.write_u8(variable.dtype().tag())?;
        writer.write_u8(variable.rank() as u8)?;
        for &dim in variable.shape() {
            writer.write_u32::<LittleEndian>(dim as u32)?;
        }
        match variable.dtype() {
            DataType::F32 => {
                for &value in variable.data::<f32>()? {
                    writer.write_f32::<LittleEndian>(value)?;
                }
            }
            DataType::F16 => {
                for &value in variable.data::<f16>()? {
                    writer.write_u16::<LittleEndian>(value.to_bits())?;
                }
            }
            DataType::I8 => {
                for &value in variable.data::<i8>()? {
                    writer.write_i8(value)?;
                }
            }
            DataType::I16 => {
                for &value in variable.data::<i16>()? {
                    writer.write_i16::<LittleEndian>(value)?;
                }
            }
            DataType::I32 => {
                for &value in variable.data::<i32>()? {
                    writer.write_i32::<LittleEndian>(value)?;
                }
            }
        }
    }
    Ok(())
}

fn is_quantizable_weight(name: &str, variable: &Storage) -> bool {
    name.ends_with("/weight") && variable.rank() == 2
}

fn dequantize_weight(variable: &Storage, scale: &Storage) -> Result<Storage> {
    let rows = variable.dim(0);
    let cols = variable.dim(1);
    let scales = scale.data::<f32>()?;
    let mut data = vec![0f32; rows * cols];
    match variable.dtype() {
        DataType::I8 => {
            let quantized = variable.data::<i8>()?;
            for r in 0..rows {
                let row_scale = scales[r.min(scales.len() - 1)];
                for c in 0..cols {
                    data[r * cols + c] = quantized[r * cols + c] as f32 / row_scale;
                }
            }
        }
        DataType::I16 => {
            let quantized = variable.data::<i16>()?;
            for (out, &value) in data.iter_mut().zip(quantized) {
                *out = value as f32 / scales[0];
            }
        }
        dtype => {
            return Err(Error::unsupported("dequantize", variable.device(), dtype));
        }
    }
    Storage::from_vec(data, &[rows, cols])
}

/// Resolves missing scales and converts weights to the requested compute
/// type, falling back to float when the target width is not supported.
/// Returns the compute type in effect.
fn finalize(
    variables: &mut VariableIndex,
    device: Device,
    compute_type: ComputeType,
) -> Result<ComputeType> {
    let (support_int8, support_int16) = match device {
        Device::Cpu => (true, true),
        #[cfg(feature = "cuda")]
        Device::Cuda(index) => (crate::cuda::gpu_supports_int8(index), false),
        #[cfg(not(feature = "cuda"))]
        Device::Cuda(_) => (false, false),
    };
    let effective = match compute_type {
        ComputeType::Int8 if !support_int8 => {
            warn!("int8 is not supported on {}; falling back to float", device);
            ComputeType::Float
        }
        ComputeType::Int16 if !support_int16 => {
            warn!(
                "int16 is not supported on {}; falling back to float",
                device
            );
            ComputeType::Float
        }
        other => other,
    };

    let names: Vec<String> = variables.names().map(String::from).collect();
    for name in names {
        let variable = variables.get(&name).expect("name was just listed");

        // Compute runs in f32; promote any half weights on the way in.
        if variable.dtype() == DataType::F16 {
            let data: Vec<f32> = variable.data::<f16>()?.iter().map(|v| v.to_f32()).collect();
            let promoted = Storage::from_vec(data, variable.shape())?;
            variables.insert(name.clone(), promoted);
            continue;
        }

        if !is_quantizable_weight(&name, &variable) {
            continue;
        }
        let scale_name = format!("{}_scale", name);

        match (variable.dtype(), effective) {
            // Quantized weight kept quantized: make sure a scale exists.
            (DataType::I8, ComputeType::Default | ComputeType::Int8)
            | (DataType::I16, ComputeType::Default | ComputeType::Int16) => {
                if !variables.contains(&scale_name) {
                    let size = if variable.dtype() == DataType::I8 {
                        variable.dim(0)
                    } else {
                        1
                    };
                    variables.insert(scale_name, Storage::from_vec(vec![1.0f32; size], &[size])?);
                }
            }
            // Quantized weight requested as float (or the other width):
            // dequantize, then possibly requantize below.
            (DataType::I8 | DataType::I16, _) => {
                let scale = match variables.get_if_exists(&scale_name) {
                    Some(scale) => scale,
                    None => Storage::from_vec(vec![1.0f32], &[1])?,
                };
                let restored = dequantize_weight(&variable, &scale)?;
                variables.remove(&scale_name);
                if effective == ComputeType::Float {
                    variables.insert(name.clone(), restored);
                } else {
                    let requantized = quantize_weight(&restored, effective)?;
                    variables.insert(scale_name, requantized.1);
                    variables.insert(name.clone(), requantized.0);
                }
            }
            // Float weight requested as integer.
            (DataType::F32, ComputeType::Int8 | ComputeType::Int16) => {
                let (quantized, scale) = quantize_weight(&variable, effective)?;
                variables.insert(scale_name, scale);
                variables.insert(name.clone(), quantized);
            }
            _ => {}
        }
    }
    debug!(compute_type = %effective, "model finalized");
    Ok(effective)
}

fn quantize_weight(variable: &Storage, compute_type: ComputeType) -> Result<(Storage, Storage)> {
    let rows = variable.dim(0);
    let cols = variable.dim(1);
    let data = variable.data::<f32>()?;
    match compute_type {
        ComputeType::Int8 => {
            let mut scales = vec![0f32; rows];
            let mut quantized = vec![0i8; rows * cols];
            cpu::quantize_batch(data, &mut scales, &mut quantized, cols);
            Ok((
                Storage::from_vec(quantized, &[rows, cols])?,
                Storage::from_vec(scales, &[rows])?,
            ))
        }
        ComputeType::Int16 => {
            let mut quantized = vec![0i16; rows * cols];
            cpu::quantize(data, &mut quantized, INT16_SCALE);
            Ok((
                Storage::from_vec(quantized, &[rows, cols])?,
                Storage::from_vec(vec![INT16_SCALE], &[1])?,
            ))
        }
        other => Err(Error::configuration(format!(
            "cannot quantize weights to {}",
            other
        ))),
    }
}
