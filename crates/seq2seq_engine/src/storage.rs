//! Typed, shaped, device-resident tensor buffer
//!
//! A `Storage` either owns its buffer or aliases another storage's buffer
//! (views, shallow copies, shared weights). Aliases hold a reference-counted
//! handle to the backing buffer, so a view can never outlive its referent,
//! and any attempt to resize or write through an aliased buffer is rejected
//! up front.

use std::sync::Arc;

use half::f16;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::types::DataType;

/// Contiguous typed buffer. The vector length is the storage capacity in
/// elements; the logical element count is derived from the shape.
pub enum Buffer {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    #[cfg(feature = "cuda")]
    Cuda(crate::cuda::CudaBuffer),
}

impl Buffer {
    fn capacity(&self) -> usize {
        match self {
            Buffer::F32(data) => data.len(),
            Buffer::F16(data) => data.len(),
            Buffer::I8(data) => data.len(),
            Buffer::I16(data) => data.len(),
            Buffer::I32(data) => data.len(),
            #[cfg(feature = "cuda")]
            Buffer::Cuda(buffer) => buffer.len,
        }
    }

    fn grow(&mut self, capacity: usize) -> Result<()> {
        match self {
            Buffer::F32(data) => data.resize(capacity, 0.0),
            Buffer::F16(data) => data.resize(capacity, f16::from_f32(0.0)),
            Buffer::I8(data) => data.resize(capacity, 0),
            Buffer::I16(data) => data.resize(capacity, 0),
            Buffer::I32(data) => data.resize(capacity, 0),
            #[cfg(feature = "cuda")]
            Buffer::Cuda(buffer) => return buffer.grow(capacity),
        }
        Ok(())
    }
}

/// Element types a host buffer can hold.
pub trait HostElem: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn make_buffer(data: Vec<Self>) -> Buffer;
    fn slice(buffer: &Buffer) -> Option<&[Self]>;
    fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]>;
}

macro_rules! impl_host_elem {
    ($ty:ty, $dtype:expr, $variant:ident) => {
        impl HostElem for $ty {
            const DTYPE: DataType = $dtype;

            fn make_buffer(data: Vec<Self>) -> Buffer {
                Buffer::$variant(data)
            }

            fn slice(buffer: &Buffer) -> Option<&[Self]> {
                match buffer {
                    Buffer::$variant(data) => Some(data),
                    _ => None,
                }
            }

            fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
                match buffer {
                    Buffer::$variant(data) => Some(data),
                    _ => None,
                }
            }
        }
    };
}

impl_host_elem!(f32, DataType::F32, F32);
impl_host_elem!(f16, DataType::F16, F16);
impl_host_elem!(i8, DataType::I8, I8);
impl_host_elem!(i16, DataType::I16, I16);
impl_host_elem!(i32, DataType::I32, I32);

fn make_empty_buffer(dtype: DataType, capacity: usize) -> Buffer {
    let mut buffer = match dtype {
        DataType::F32 => Buffer::F32(Vec::new()),
        DataType::F16 => Buffer::F16(Vec::new()),
        DataType::I8 => Buffer::I8(Vec::new()),
        DataType::I16 => Buffer::I16(Vec::new()),
        DataType::I32 => Buffer::I32(Vec::new()),
    };
    buffer.grow(capacity).expect("host buffers always grow");
    buffer
}

pub type Shape = Vec<usize>;

pub struct Storage {
    device: Device,
    dtype: DataType,
    shape: Shape,
    buffer: Arc<Buffer>,
    offset: usize,
    owning: bool,
}

pub fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl Storage {
    /// Creates an empty owning storage.
    pub fn new(device: Device, dtype: DataType) -> Storage {
        Storage {
            device,
            dtype,
            shape: vec![0],
            buffer: Arc::new(make_empty_buffer(dtype, 0)),
            offset: 0,
            owning: true,
        }
    }

    /// Creates a zero-filled owning storage of the given shape.
    pub fn zeros(device: Device, dtype: DataType, shape: &[usize]) -> Storage {
        let mut storage = Storage::new(device, dtype);
        storage
            .resize(shape)
            .expect("resizing a fresh storage cannot fail");
        storage
    }

    /// Creates a CPU storage from existing host data.
    pub fn from_vec<T: HostElem>(data: Vec<T>, shape: &[usize]) -> Result<Storage> {
        if data.len() != shape_size(shape) {
            return Err(Error::precondition(format!(
                "data length {} does not match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Storage {
            device: Device::Cpu,
            dtype: T::DTYPE,
            shape: shape.to_vec(),
            buffer: Arc::new(T::make_buffer(data)),
            offset: 0,
            owning: true,
        })
    }

    /// Creates a rank-0 scalar storage.
    pub fn scalar<T: HostElem>(value: T) -> Storage {
        Storage {
            device: Device::Cpu,
            dtype: T::DTYPE,
            shape: Vec::new(),
            buffer: Arc::new(T::make_buffer(vec![value])),
            offset: 0,
            owning: true,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Dimension size; negative indices count from the back.
    pub fn dim(&self, axis: isize) -> usize {
        let axis = self.resolve_axis(axis);
        self.shape[axis]
    }

    pub fn resolve_axis(&self, axis: isize) -> usize {
        if axis < 0 {
            (self.rank() as isize + axis) as usize
        } else {
            axis as usize
        }
    }

    /// Row-major stride of `axis` in elements.
    pub fn stride(&self, axis: isize) -> usize {
        let axis = self.resolve_axis(axis);
        self.shape[axis + 1..].iter().product()
    }

    /// Logical element count.
    pub fn size(&self) -> usize {
        shape_size(&self.shape)
    }

    /// Allocated element count of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn owning(&self) -> bool {
        self.owning
    }

    /// Reinterprets the storage under a new shape, growing the buffer when
    /// needed. The buffer never shrinks. Only owning, un-aliased storages
    /// can be resized.
    pub fn resize(&mut self, shape: &[usize]) -> Result<&mut Storage> {
        if !self.owning {
            return Err(Error::precondition("cannot resize a non-owning storage"));
        }
        let size = shape_size(shape);
        if size > self.buffer.capacity() {
            let buffer = Arc::get_mut(&mut self.buffer)
                .ok_or_else(|| Error::precondition("cannot resize an aliased storage"))?;
            buffer.grow(size)?;
        }
        self.shape = shape.to_vec();
        Ok(self)
    }

    /// Changes the shape without touching the buffer; the element count must
    /// be preserved.
    pub fn reshape(&mut self, shape: &[usize]) -> Result<&mut Storage> {
        if shape_size(shape) != self.size() {
            return Err(Error::precondition(format!(
                "reshape from {:?} to {:?} changes the element count",
                self.shape, shape
            )));
        }
        self.shape = shape.to_vec();
        Ok(self)
    }

    /// Returns a non-owning alias of this storage (same buffer, same shape).
    pub fn alias(&self) -> Storage {
        Storage {
            device: self.device,
            dtype: self.dtype,
            shape: self.shape.clone(),
            buffer: Arc::clone(&self.buffer),
            offset: self.offset,
            owning: false,
        }
    }

    /// Turns `self` into a non-owning alias of `other`.
    pub fn shallow_copy(&mut self, other: &Storage) {
        *self = other.alias();
    }

    /// Returns a non-owning view into `base` starting at `offset` elements,
    /// with the given shape.
    pub fn view_of(base: &Storage, offset: usize, shape: &[usize]) -> Result<Storage> {
        let size = shape_size(shape);
        if base.offset + offset + size > base.capacity() {
            return Err(Error::precondition(format!(
                "view of {} elements at offset {} exceeds buffer capacity {}",
                size,
                offset,
                base.capacity()
            )));
        }
        Ok(Storage {
            device: base.device,
            dtype: base.dtype,
            shape: shape.to_vec(),
            buffer: Arc::clone(&base.buffer),
            offset: base.offset + offset,
            owning: false,
        })
    }

    /// Read access to the host data.
    pub fn data<T: HostElem>(&self) -> Result<&[T]> {
        if self.device != Device::Cpu {
            return Err(Error::precondition(format!(
                "host access to data on {}",
                self.device
            )));
        }
        if T::DTYPE != self.dtype {
            return Err(Error::precondition(format!(
                "accessing {} storage as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        let slice = T::slice(&self.buffer).expect("buffer variant matches dtype");
        Ok(&slice[self.offset..self.offset + self.size()])
    }

    /// Write access to the host data. Only owning, un-aliased storages can
    /// be written through.
    pub fn data_mut<T: HostElem>(&mut self) -> Result<&mut [T]> {
        if self.device != Device::Cpu {
            return Err(Error::precondition(format!(
                "host access to data on {}",
                self.device
            )));
        }
        if T::DTYPE != self.dtype {
            return Err(Error::precondition(format!(
                "accessing {} storage as {}",
                self.dtype,
                T::DTYPE
            )));
        }
        if !self.owning {
            return Err(Error::precondition("cannot write through a non-owning storage"));
        }
        let size = self.size();
        let buffer = Arc::get_mut(&mut self.buffer)
            .ok_or_else(|| Error::precondition("cannot write to an aliased storage"))?;
        let slice = T::slice_mut(buffer).expect("buffer variant matches dtype");
        Ok(&mut slice[..size])
    }

    /// Element access by multi-dimensional index.
    pub fn at<T: HostElem>(&self, indices: &[usize]) -> Result<T> {
        if indices.len() != self.rank() {
            return Err(Error::precondition(format!(
                "index of rank {} into storage of rank {}",
                indices.len(),
                self.rank()
            )));
        }
        let mut linear = 0;
        for (axis, &index) in indices.iter().enumerate() {
            if index >= self.shape[axis] {
                return Err(Error::precondition(format!(
                    "index {} out of range for dimension {} of size {}",
                    index, axis, self.shape[axis]
                )));
            }
            linear = linear * self.shape[axis] + index;
        }
        Ok(self.data::<T>()?[linear])
    }

    /// Copies `data` (resident on `src_device`) into this storage, which
    /// must already have the matching size.
    pub fn copy_from<T: HostElem>(&mut self, data: &[T], src_device: Device) -> Result<()> {
        if data.len() != self.size() {
            return Err(Error::precondition(format!(
                "copying {} elements into a storage of {} elements",
                data.len(),
                self.size()
            )));
        }
        match (src_device, self.device) {
            (Device::Cpu, Device::Cpu) => {
                self.data_mut::<T>()?.copy_from_slice(data);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            (Device::Cpu, Device::Cuda(index)) => crate::cuda::copy_to_device(data, self, index),
            _ => Err(Error::precondition(format!(
                "unsupported copy from {} to {}",
                src_device, self.device
            ))),
        }
    }

    /// Copies the contents out to a host vector.
    pub fn to_vec<T: HostElem>(&self) -> Result<Vec<T>> {
        match self.device {
            Device::Cpu => Ok(self.data::<T>()?.to_vec()),
            #[cfg(feature = "cuda")]
            Device::Cuda(_) => crate::cuda::copy_to_host(self),
            #[cfg(not(feature = "cuda"))]
            _ => Err(Error::precondition(format!(
                "host access to data on {}",
                self.device
            ))),
        }
    }

    /// Returns a new storage on `device` holding a copy of this storage's
    /// contents.
    pub fn to(&self, device: Device) -> Result<Storage> {
        device.validate()?;
        match (self.device, device) {
            (Device::Cpu, Device::Cpu) => {
                let mut copy = Storage::new(device, self.dtype);
                copy.resize(&self.shape)?;
                match self.dtype {
                    DataType::F32 => copy.copy_from(self.data::<f32>()?, Device::Cpu)?,
                    DataType::F16 => copy.copy_from(self.data::<f16>()?, Device::Cpu)?,
                    DataType::I8 => copy.copy_from(self.data::<i8>()?, Device::Cpu)?,
                    DataType::I16 => copy.copy_from(self.data::<i16>()?, Device::Cpu)?,
                    DataType::I32 => copy.copy_from(self.data::<i32>()?, Device::Cpu)?,
                }
                Ok(copy)
            }
            #[cfg(feature = "cuda")]
            (Device::Cpu, Device::Cuda(index)) => crate::cuda::storage_to_device(self, index),
            #[cfg(feature = "cuda")]
            (Device::Cuda(_), Device::Cpu) => crate::cuda::storage_to_host(self),
            #[cfg(feature = "cuda")]
            (Device::Cuda(_), Device::Cuda(_)) => crate::cuda::storage_to_host(self)?.to(device),
            #[cfg(not(feature = "cuda"))]
            _ => Err(Error::configuration(
                "this build does not support CUDA devices",
            )),
        }
    }
}

#[cfg(feature = "cuda")]
impl Storage {
    /// Wraps a CUDA buffer as an owning storage.
    pub fn from_cuda_buffer(buffer: crate::cuda::CudaBuffer, shape: &[usize]) -> Storage {
        Storage {
            device: Device::Cuda(buffer.device_index()),
            dtype: buffer.dtype,
            shape: shape.to_vec(),
            buffer: Arc::new(Buffer::Cuda(buffer)),
            offset: 0,
            owning: true,
        }
    }

    pub fn cuda_buffer(&self) -> Result<&crate::cuda::CudaBuffer> {
        match &*self.buffer {
            Buffer::Cuda(buffer) => Ok(buffer),
            _ => Err(Error::precondition("storage is not CUDA-resident")),
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("owning", &self.owning)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_grows_but_never_shrinks() {
        let mut storage = Storage::new(Device::Cpu, DataType::F32);
        storage.resize(&[2, 3]).unwrap();
        assert_eq!(storage.size(), 6);
        let capacity = storage.capacity();
        assert!(storage.size() <= capacity);

        storage.resize(&[1, 2]).unwrap();
        assert_eq!(storage.size(), 2);
        assert_eq!(storage.capacity(), capacity);

        storage.resize(&[4, 4]).unwrap();
        assert!(storage.capacity() >= 16);
    }

    #[test]
    fn reshape_preserves_element_count() {
        let mut storage = Storage::from_vec((0..6).map(|v| v as f32).collect(), &[2, 3]).unwrap();
        storage.reshape(&[3, 2]).unwrap();
        assert_eq!(storage.at::<f32>(&[2, 1]).unwrap(), 5.0);
        assert!(storage.reshape(&[4, 2]).is_err());
    }

    #[test]
    fn views_alias_the_buffer() {
        let base = Storage::from_vec((0..12).map(|v| v as f32).collect(), &[3, 4]).unwrap();
        let view = Storage::view_of(&base, 4, &[2, 4]).unwrap();
        assert!(!view.owning());
        assert_eq!(view.at::<f32>(&[0, 0]).unwrap(), 4.0);
        assert_eq!(view.at::<f32>(&[1, 3]).unwrap(), 11.0);
        assert!(Storage::view_of(&base, 8, &[2, 4]).is_err());
    }

    #[test]
    fn aliased_storage_rejects_resize_and_writes() {
        let mut base = Storage::from_vec(vec![1.0f32; 8], &[8]).unwrap();
        let _view = Storage::view_of(&base, 0, &[4]).unwrap();
        assert!(base.resize(&[16]).is_err());
        assert!(base.data_mut::<f32>().is_err());
    }

    #[test]
    fn dtype_mismatch_is_a_precondition_error() {
        let storage = Storage::from_vec(vec![1i32, 2, 3], &[3]).unwrap();
        assert!(storage.data::<f32>().is_err());
        assert!(matches!(
            storage.at::<f32>(&[0]),
            Err(crate::error::Error::Precondition(_))
        ));
    }

    #[test]
    fn out_of_range_index() {
        let storage = Storage::from_vec(vec![1.0f32, 2.0], &[2]).unwrap();
        assert!(storage.at::<f32>(&[2]).is_err());
        assert!(storage.at::<f32>(&[0, 0]).is_err());
    }

    #[test]
    fn scalar_storage_has_rank_zero() {
        let storage = Storage::scalar(3.5f32);
        assert_eq!(storage.rank(), 0);
        assert_eq!(storage.size(), 1);
        assert_eq!(storage.at::<f32>(&[]).unwrap(), 3.5);
    }

    #[test]
    fn cpu_round_trip_preserves_contents() {
        let storage = Storage::from_vec(vec![1i16, -2, 3, -4], &[2, 2]).unwrap();
        let copy = storage.to(Device::Cpu).unwrap();
        assert_eq!(copy.dtype(), DataType::I16);
        assert_eq!(copy.shape(), &[2, 2]);
        assert_eq!(copy.to_vec::<i16>().unwrap(), vec![1, -2, 3, -4]);
    }
}
