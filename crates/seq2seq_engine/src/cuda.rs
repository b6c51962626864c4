//! CUDA device contexts and buffers (feature `cuda`)
//!
//! Each host thread owns an independent context: a cudarc device handle
//! plus a bin-caching allocation pool configured from
//! `CT2_CUDA_CACHING_ALLOCATOR_CONFIG`. Contexts are torn down when the
//! thread exits. Device blocks are bin-sized; transfers pad up to the bin
//! on upload and truncate on download.

use std::cell::RefCell;
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice};

use crate::allocator::{AllocatorConfig, BlockAllocator, CachingPool, PooledBlock};
use crate::error::{Error, Result};
use crate::storage::{HostElem, Storage};
use crate::types::DataType;

struct DeviceAllocator {
    device: Arc<CudaDevice>,
}

impl BlockAllocator for DeviceAllocator {
    type Block = CudaSlice<u8>;

    fn allocate(&self, bytes: usize) -> Result<CudaSlice<u8>> {
        self.device
            .alloc_zeros::<u8>(bytes)
            .map_err(|err| Error::Resource(format!("CUDA allocation of {} bytes: {}", bytes, err)))
    }
}

struct CudaContext {
    index: i32,
    device: Arc<CudaDevice>,
    pool: RefCell<CachingPool<DeviceAllocator>>,
}

impl CudaContext {
    fn new(index: i32) -> Result<CudaContext> {
        let device = CudaDevice::new(index as usize)
            .map_err(|err| Error::Device(format!("CUDA device {}: {}", index, err)))?;
        let config = AllocatorConfig::from_env()?;
        let pool = CachingPool::new(
            config,
            DeviceAllocator {
                device: Arc::clone(&device),
            },
        );
        Ok(CudaContext {
            index,
            device,
            pool: RefCell::new(pool),
        })
    }
}

thread_local! {
    static CONTEXTS: RefCell<Vec<CudaContext>> = const { RefCell::new(Vec::new()) };
}

fn with_context<R>(index: i32, f: impl FnOnce(&CudaContext) -> Result<R>) -> Result<R> {
    CONTEXTS.with(|contexts| {
        let mut contexts = contexts.borrow_mut();
        if !contexts.iter().any(|context| context.index == index) {
            contexts.push(CudaContext::new(index)?);
        }
        let context = contexts
            .iter()
            .find(|context| context.index == index)
            .expect("context was just inserted");
        f(context)
    })
}

pub fn gpu_count() -> usize {
    cudarc::driver::result::device::get_count().map_or(0, |count| count as usize)
}

pub fn gpu_supports_int8(index: i32) -> bool {
    use cudarc::driver::sys::CUdevice_attribute;
    with_context(index, |context| {
        let major = context
            .device
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .map_err(|err| Error::Device(err.to_string()))?;
        let minor = context
            .device
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .map_err(|err| Error::Device(err.to_string()))?;
        Ok(major > 6 || (major == 6 && minor >= 1))
    })
    .unwrap_or(false)
}

/// Typed device buffer backed by a block from the thread's caching pool.
/// The block returns to the pool on drop.
pub struct CudaBuffer {
    pub dtype: DataType,
    /// Element capacity.
    pub len: usize,
    device_index: i32,
    block: Option<PooledBlock<CudaSlice<u8>>>,
}

impl CudaBuffer {
    pub fn alloc(device_index: i32, dtype: DataType, len: usize) -> Result<CudaBuffer> {
        let bytes = len * dtype.size();
        let block = with_context(device_index, |context| context.pool.borrow_mut().get(bytes))?;
        Ok(CudaBuffer {
            dtype,
            len,
            device_index,
            block: Some(block),
        })
    }

    pub fn device_index(&self) -> i32 {
        self.device_index
    }

    fn slice(&self) -> &CudaSlice<u8> {
        &self.block.as_ref().expect("buffer is live until drop").block
    }

    fn slice_mut(&mut self) -> &mut CudaSlice<u8> {
        &mut self.block.as_mut().expect("buffer is live until drop").block
    }

    pub fn grow(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.len {
            return Ok(());
        }
        // Round-trip through the host; resizes happen outside the step
        // loop so simplicity wins over an on-device copy here.
        let mut bytes = self.download()?;
        bytes.resize(capacity * self.dtype.size(), 0);
        *self = CudaBuffer::upload(self.device_index, self.dtype, capacity, &bytes)?;
        Ok(())
    }

    /// Uploads host bytes (padded to the block size) into a fresh buffer.
    pub fn upload(
        device_index: i32,
        dtype: DataType,
        len: usize,
        bytes: &[u8],
    ) -> Result<CudaBuffer> {
        let mut buffer = CudaBuffer::alloc(device_index, dtype, len)?;
        let mut padded = bytes.to_vec();
        padded.resize(buffer.slice().len(), 0);
        with_context(device_index, |context| {
            context
                .device
                .htod_sync_copy_into(&padded, buffer.slice_mut())
                .map_err(|err| Error::Device(err.to_string()))
        })?;
        Ok(buffer)
    }

    /// Downloads the logical contents (block truncated to `len` elements).
    pub fn download(&self) -> Result<Vec<u8>> {
        let mut bytes = with_context(self.device_index, |context| {
            context
                .device
                .dtoh_sync_copy(self.slice())
                .map_err(|err| Error::Device(err.to_string()))
        })?;
        bytes.truncate(self.len * self.dtype.size());
        Ok(bytes)
    }
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        // Hand the block back to the owning thread's pool; on other
        // threads the context lookup re-creates a context, which still
        // frees or caches the block correctly.
        if let Some(block) = self.block.take() {
            let device_index = self.device_index;
            let _ = with_context(device_index, move |context| {
                context.pool.borrow_mut().put(block);
                Ok(())
            });
        }
    }
}

fn host_bytes<T: HostElem>(data: &[T]) -> &[u8] {
    // T is a plain numeric type; viewing it as bytes is well-defined.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}

fn bytes_to_host<T: HostElem>(bytes: &[u8]) -> Vec<T> {
    let count = bytes.len() / std::mem::size_of::<T>();
    let mut data = Vec::with_capacity(count);
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const T, data.as_mut_ptr(), count);
        data.set_len(count);
    }
    data
}

/// Copies host data into a CUDA storage of the same size.
pub fn copy_to_device<T: HostElem>(data: &[T], storage: &mut Storage, index: i32) -> Result<()> {
    let buffer = CudaBuffer::upload(index, T::DTYPE, data.len(), host_bytes(data))?;
    let shape = storage.shape().to_vec();
    *storage = Storage::from_cuda_buffer(buffer, &shape);
    Ok(())
}

/// Copies a CUDA storage's contents back to a host vector.
pub fn copy_to_host<T: HostElem>(storage: &Storage) -> Result<Vec<T>> {
    let buffer = storage.cuda_buffer()?;
    let mut bytes = buffer.download()?;
    bytes.truncate(storage.size() * std::mem::size_of::<T>());
    Ok(bytes_to_host(&bytes))
}

/// `storage.to(Device::Cuda(index))` for host storages.
pub fn storage_to_device(storage: &Storage, index: i32) -> Result<Storage> {
    let shape = storage.shape().to_vec();
    let mut target = Storage::from_cuda_buffer(
        CudaBuffer::alloc(index, storage.dtype(), storage.size())?,
        &shape,
    );
    match storage.dtype() {
        DataType::F32 => copy_to_device(storage.data::<f32>()?, &mut target, index)?,
        DataType::F16 => copy_to_device(storage.data::<half::f16>()?, &mut target, index)?,
        DataType::I8 => copy_to_device(storage.data::<i8>()?, &mut target, index)?,
        DataType::I16 => copy_to_device(storage.data::<i16>()?, &mut target, index)?,
        DataType::I32 => copy_to_device(storage.data::<i32>()?, &mut target, index)?,
    }
    Ok(target)
}

/// `storage.to(Device::Cpu)` for CUDA storages.
pub fn storage_to_host(storage: &Storage) -> Result<Storage> {
    let shape = storage.shape().to_vec();
    match storage.dtype() {
        DataType::F32 => Storage::from_vec(copy_to_host::<f32>(storage)?, &shape),
        DataType::F16 => Storage::from_vec(copy_to_host::<half::f16>(storage)?, &shape),
        DataType::I8 => Storage::from_vec(copy_to_host::<i8>(storage)?, &shape),
        DataType::I16 => Storage::from_vec(copy_to_host::<i16>(storage)?, &shape),
        DataType::I32 => Storage::from_vec(copy_to_host::<i32>(storage)?, &shape),
    }
}
