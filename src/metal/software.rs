//! A software rendition of the storage-mode runtime, backed by plain host
//! memory.
//!
//! Buffers, heaps, and encoders behave like their device counterparts as
//! far as this crate's contract is concerned, and they record the calls
//! made against them so tests can assert the synchronization protocol.
//! Creation can be selectively denied to exercise the degradation and
//! exhaustion paths.

use std::{
    cell::UnsafeCell,
    ffi::c_void,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use ash::vk;

use super::{
    BlitCommandEncoder, CommandBuffer, DeviceCapabilities, MetalBuffer,
    MetalDevice, MetalHeap, MetalTexture, ResourceOptions, StorageMode,
};
use crate::device_memory::MemoryError;

/// A device whose resources live in host memory.
pub struct SoftwareDevice {
    capabilities: DeviceCapabilities,
    deny_heaps: AtomicBool,
    deny_carves: AtomicBool,
    deny_buffers: AtomicBool,
    deny_encoders: AtomicBool,
    heaps_created: AtomicUsize,
    encoders_created: AtomicUsize,
    buffers: Mutex<Vec<Arc<SoftwareBuffer>>>,
}

impl SoftwareDevice {
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            deny_heaps: AtomicBool::new(false),
            deny_carves: AtomicBool::new(false),
            deny_buffers: AtomicBool::new(false),
            deny_encoders: AtomicBool::new(false),
            heaps_created: AtomicUsize::new(0),
            encoders_created: AtomicUsize::new(0),
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent heap creation fail, as if the device were
    /// fragmented or out of memory.
    pub fn deny_heap_creation(&self, deny: bool) {
        self.deny_heaps.store(deny, Ordering::Relaxed);
    }

    /// Make heaps created from now on refuse to carve buffers, as if the
    /// heap's free space were fragmented.
    pub fn deny_heap_carving(&self, deny: bool) {
        self.deny_carves.store(deny, Ordering::Relaxed);
    }

    /// Make subsequent buffer creation fail.
    pub fn deny_buffer_creation(&self, deny: bool) {
        self.deny_buffers.store(deny, Ordering::Relaxed);
    }

    /// Make subsequent encoder creation fail, as if command buffers were
    /// exhausted.
    pub fn deny_encoder_creation(&self, deny: bool) {
        self.deny_encoders.store(deny, Ordering::Relaxed);
    }

    pub fn heaps_created(&self) -> usize {
        self.heaps_created.load(Ordering::Relaxed)
    }

    pub fn buffers_created(&self) -> usize {
        self.buffers
            .lock()
            .expect("unable to acquire the created-buffer log")
            .len()
    }

    /// The most recently created standalone buffer, retained so tests can
    /// observe the calls made against it.
    pub fn last_buffer(&self) -> Option<Arc<SoftwareBuffer>> {
        self.buffers
            .lock()
            .expect("unable to acquire the created-buffer log")
            .last()
            .cloned()
    }

    pub fn encoders_created(&self) -> usize {
        self.encoders_created.load(Ordering::Relaxed)
    }
}

impl MetalDevice for SoftwareDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn new_buffer(
        &self,
        length: vk::DeviceSize,
        options: ResourceOptions,
    ) -> Result<Arc<dyn MetalBuffer>, MemoryError> {
        if self.deny_buffers.load(Ordering::Relaxed) {
            return Err(MemoryError::OutOfDeviceMemory { size: length });
        }
        let buffer =
            Arc::new(SoftwareBuffer::new(length, options.storage_mode));
        self.buffers
            .lock()
            .expect("unable to acquire the created-buffer log")
            .push(buffer.clone());
        Ok(buffer)
    }

    fn new_buffer_with_host_memory(
        &self,
        host_memory: NonNull<c_void>,
        length: vk::DeviceSize,
        options: ResourceOptions,
    ) -> Result<Arc<dyn MetalBuffer>, MemoryError> {
        if self.deny_buffers.load(Ordering::Relaxed) {
            return Err(MemoryError::OutOfDeviceMemory { size: length });
        }
        let buffer = Arc::new(SoftwareBuffer::wrapping(
            host_memory,
            length,
            options.storage_mode,
        ));
        self.buffers
            .lock()
            .expect("unable to acquire the created-buffer log")
            .push(buffer.clone());
        Ok(buffer)
    }

    fn new_heap(
        &self,
        size: vk::DeviceSize,
        options: ResourceOptions,
    ) -> Result<Arc<dyn MetalHeap>, MemoryError> {
        if self.deny_heaps.load(Ordering::Relaxed) {
            return Err(MemoryError::OutOfDeviceMemory { size });
        }
        self.heaps_created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(SoftwareHeap {
            size,
            options,
            deny_carves: self.deny_carves.load(Ordering::Relaxed),
            label: Mutex::new(None),
        }))
    }

    fn new_blit_encoder(
        &self,
    ) -> Result<
        (Arc<dyn BlitCommandEncoder>, Arc<dyn CommandBuffer>),
        MemoryError,
    > {
        if self.deny_encoders.load(Ordering::Relaxed) {
            return Err(MemoryError::ResourceBusy {
                reason: "no command buffer is available for blit encoding",
            });
        }
        self.encoders_created.fetch_add(1, Ordering::Relaxed);
        Ok((
            Arc::new(SoftwareBlitEncoder::default()),
            Arc::new(SoftwareCommandBuffer::default()),
        ))
    }
}

enum BufferStorage {
    Owned(Box<[UnsafeCell<u8>]>),
    External(NonNull<c_void>),
}

/// A buffer whose "device" storage is a host allocation.
pub struct SoftwareBuffer {
    length: vk::DeviceSize,
    storage_mode: StorageMode,
    heap_offset: vk::DeviceSize,
    storage: BufferStorage,
    modified_ranges: Mutex<Vec<(vk::DeviceSize, vk::DeviceSize)>>,
    label: Mutex<Option<String>>,
}

// The storage is host memory handed out through contents(); exclusive
// access to mapped contents is the caller's contract, same as on a real
// device.
unsafe impl Send for SoftwareBuffer {}
unsafe impl Sync for SoftwareBuffer {}

impl SoftwareBuffer {
    pub fn new(length: vk::DeviceSize, storage_mode: StorageMode) -> Self {
        let storage = (0..length as usize)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Box<[UnsafeCell<u8>]>>();
        Self {
            length,
            storage_mode,
            heap_offset: 0,
            storage: BufferStorage::Owned(storage),
            modified_ranges: Mutex::new(Vec::new()),
            label: Mutex::new(None),
        }
    }

    fn wrapping(
        host_memory: NonNull<c_void>,
        length: vk::DeviceSize,
        storage_mode: StorageMode,
    ) -> Self {
        Self {
            length,
            storage_mode,
            heap_offset: 0,
            storage: BufferStorage::External(host_memory),
            modified_ranges: Mutex::new(Vec::new()),
            label: Mutex::new(None),
        }
    }

    fn carved(
        length: vk::DeviceSize,
        offset: vk::DeviceSize,
        storage_mode: StorageMode,
    ) -> Self {
        Self {
            heap_offset: offset,
            ..Self::new(length, storage_mode)
        }
    }

    /// Every range reported through did_modify_range, in call order.
    pub fn modified_ranges(&self) -> Vec<(vk::DeviceSize, vk::DeviceSize)> {
        self.modified_ranges
            .lock()
            .expect("unable to acquire the modified-range log")
            .clone()
    }

    pub fn label(&self) -> Option<String> {
        self.label
            .lock()
            .expect("unable to acquire the buffer label")
            .clone()
    }
}

impl MetalBuffer for SoftwareBuffer {
    fn length(&self) -> vk::DeviceSize {
        self.length
    }

    fn contents(&self) -> *mut c_void {
        if !self.storage_mode.is_host_accessible() {
            return std::ptr::null_mut();
        }
        match &self.storage {
            BufferStorage::Owned(bytes) => {
                bytes.as_ptr() as *mut c_void
            }
            BufferStorage::External(ptr) => ptr.as_ptr(),
        }
    }

    fn did_modify_range(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        self.modified_ranges
            .lock()
            .expect("unable to acquire the modified-range log")
            .push((offset, size));
    }

    fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    fn heap_offset(&self) -> vk::DeviceSize {
        self.heap_offset
    }

    fn set_label(&self, label: &str) {
        *self
            .label
            .lock()
            .expect("unable to acquire the buffer label") =
            Some(label.to_owned());
    }
}

/// A texture stand-in: only the storage mode matters to this crate.
pub struct SoftwareTexture {
    storage_mode: StorageMode,
    label: Mutex<Option<String>>,
}

impl SoftwareTexture {
    pub fn new(storage_mode: StorageMode) -> Self {
        Self {
            storage_mode,
            label: Mutex::new(None),
        }
    }

    pub fn label(&self) -> Option<String> {
        self.label
            .lock()
            .expect("unable to acquire the texture label")
            .clone()
    }
}

impl MetalTexture for SoftwareTexture {
    fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    fn set_label(&self, label: &str) {
        *self
            .label
            .lock()
            .expect("unable to acquire the texture label") =
            Some(label.to_owned());
    }
}

/// A placement heap that carves software buffers at explicit offsets.
pub struct SoftwareHeap {
    size: vk::DeviceSize,
    options: ResourceOptions,
    deny_carves: bool,
    label: Mutex<Option<String>>,
}

impl MetalHeap for SoftwareHeap {
    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn resource_options(&self) -> ResourceOptions {
        self.options
    }

    fn new_buffer(
        &self,
        length: vk::DeviceSize,
        offset: vk::DeviceSize,
        options: ResourceOptions,
    ) -> Result<Arc<dyn MetalBuffer>, MemoryError> {
        let end = offset.checked_add(length);
        if self.deny_carves
            || end.is_none()
            || end.unwrap_or(0) > self.size
        {
            return Err(MemoryError::OutOfDeviceMemory { size: length });
        }
        Ok(Arc::new(SoftwareBuffer::carved(
            length,
            offset,
            options.storage_mode,
        )))
    }

    fn set_label(&self, label: &str) {
        *self
            .label
            .lock()
            .expect("unable to acquire the heap label") =
            Some(label.to_owned());
    }
}

/// A blit encoder that records synchronization requests instead of
/// executing them.
#[derive(Default)]
pub struct SoftwareBlitEncoder {
    synchronized: Mutex<Vec<(vk::DeviceSize, vk::DeviceSize)>>,
    ended: AtomicBool,
}

impl SoftwareBlitEncoder {
    /// Every range passed to synchronize_buffer, in call order.
    pub fn synchronized_ranges(
        &self,
    ) -> Vec<(vk::DeviceSize, vk::DeviceSize)> {
        self.synchronized
            .lock()
            .expect("unable to acquire the synchronization log")
            .clone()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Relaxed)
    }
}

impl BlitCommandEncoder for SoftwareBlitEncoder {
    fn synchronize_buffer(
        &self,
        _buffer: &dyn MetalBuffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        self.synchronized
            .lock()
            .expect("unable to acquire the synchronization log")
            .push((offset, size));
    }

    fn end_encoding(&self) {
        self.ended.store(true, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct SoftwareCommandBuffer {
    committed: AtomicBool,
}

impl SoftwareCommandBuffer {
    pub fn was_committed(&self) -> bool {
        self.committed.load(Ordering::Relaxed)
    }
}

impl CommandBuffer for SoftwareCommandBuffer {
    fn commit(&self) {
        self.committed.store(true, Ordering::Relaxed);
    }
}
