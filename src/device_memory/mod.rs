//! The device-memory aggregate: one Vulkan-style allocation, its backing
//! resource on the storage-mode runtime, its host mapping, and the set of
//! buffer/image bindings sharing it.

mod backing;
mod bindings;
mod map;
mod sync;

use std::{
    ffi::c_void,
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use ash::vk;
use thiserror::Error;

use crate::metal::{
    derive_cpu_cache_mode, derive_storage_mode, CpuCacheMode, MetalBuffer,
    MetalDevice, MetalHeap, MetalTexture, ResourceOptions, StorageMode,
};

use self::backing::HostStaging;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("out of host memory while reserving {size} bytes")]
    OutOfHostMemory { size: vk::DeviceSize },

    #[error("the device could not back an allocation of {size} bytes")]
    OutOfDeviceMemory { size: vk::DeviceSize },

    #[error("unable to map device memory: {reason}")]
    MemoryMapFailed { reason: &'static str },

    #[error(
        "the range at offset {offset} with size {size} lies outside an \
         allocation of {allocation_size} bytes"
    )]
    InvalidRange {
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        allocation_size: vk::DeviceSize,
    },

    #[error(
        "a binding at offset {offset} violates the required alignment of \
         {alignment} bytes"
    )]
    MisalignedBinding {
        offset: vk::DeviceSize,
        alignment: vk::DeviceSize,
    },

    #[error("the resource is busy: {reason}")]
    ResourceBusy { reason: &'static str },
}

/// The subrange of an allocation that is currently mapped to host memory.
/// `{0,0}` means "not mapped".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MappedMemoryRange {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl MappedMemoryRange {
    pub fn is_mapped(&self) -> bool {
        self.size > 0
    }
}

/// A subrange of a placement heap occupied by this allocation.
#[derive(Clone, Default)]
pub struct HeapAllocation {
    pub heap: Option<Arc<dyn MetalHeap>>,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub align: vk::DeviceSize,
}

impl HeapAllocation {
    pub fn is_valid(&self) -> bool {
        self.heap.is_some() && self.size != 0
    }
}

/// A higher-level buffer object bound into a subrange of an allocation.
/// Opaque to this crate beyond its range and alignment contract; identity
/// is `Arc` pointer identity.
pub trait BufferBinding: Send + Sync {
    /// Offset of the buffer within its device-memory allocation.
    fn memory_offset(&self) -> vk::DeviceSize;

    /// Size in bytes of the bound range.
    fn byte_size(&self) -> vk::DeviceSize;

    /// Required alignment of the offset within the allocation.
    fn required_memory_alignment(&self) -> vk::DeviceSize;
}

/// A higher-level image memory binding sharing an allocation.
pub trait ImageBinding: Send + Sync {
    fn memory_offset(&self) -> vk::DeviceSize;

    fn byte_size(&self) -> vk::DeviceSize;

    fn required_memory_alignment(&self) -> vk::DeviceSize;
}

/// The face an allocation presents to the device: buffer-shaped,
/// texture-shaped, or not yet materialized. Never both at once.
#[derive(Clone)]
pub enum BackingResource {
    None,
    Buffer(Arc<dyn MetalBuffer>),
    Texture(Arc<dyn MetalTexture>),
}

impl BackingResource {
    pub fn buffer(&self) -> Option<&Arc<dyn MetalBuffer>> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn texture(&self) -> Option<&Arc<dyn MetalTexture>> {
        match self {
            Self::Texture(texture) => Some(texture),
            _ => None,
        }
    }

    pub fn is_texture(&self) -> bool {
        matches!(self, Self::Texture(_))
    }
}

/// The single implicit resource of a dedicated allocation.
#[derive(Clone)]
pub enum DedicatedResource {
    Buffer(Arc<dyn BufferBinding>),
    Image(Arc<dyn ImageBinding>),
}

/// Parameters for a device-memory allocation.
#[derive(Clone)]
pub struct DeviceMemoryAllocateInfo {
    pub allocation_size: vk::DeviceSize,
    pub property_flags: vk::MemoryPropertyFlags,
    pub allocate_flags: vk::MemoryAllocateFlags,

    /// True when the allocation backs exactly one resource. Set implicitly
    /// by `dedicated_texture`.
    pub dedicated: bool,

    /// A dedicated-image target. The texture immediately becomes the
    /// allocation's backing resource and dictates the storage mode.
    pub dedicated_texture: Option<Arc<dyn MetalTexture>>,

    /// Caller-owned host memory backing the allocation. The caller must
    /// keep it alive and unmoved for the allocation's lifetime; it is
    /// never freed by this crate.
    pub imported_host_memory: Option<NonNull<c_void>>,
}

impl DeviceMemoryAllocateInfo {
    pub fn new(
        allocation_size: vk::DeviceSize,
        property_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            allocation_size,
            property_flags,
            allocate_flags: vk::MemoryAllocateFlags::empty(),
            dedicated: false,
            dedicated_texture: None,
            imported_host_memory: None,
        }
    }
}

#[derive(Default)]
struct BindingSets {
    buffers: Vec<Arc<dyn BufferBinding>>,
    images: Vec<Arc<dyn ImageBinding>>,
}

/// One allocation request granted by the device.
///
/// The backing resource and host pointer are realized lazily on first
/// bind, map, or flush; only the dedicated-texture case knows its shape at
/// construction. Map/unmap/flush/pull require `&mut self`; the caller, not
/// this type, serializes them. Binding removal goes through the internal
/// bindings lock and stays correct when racing teardown from a resource
/// destructor on another thread.
pub struct DeviceMemory {
    device: Arc<dyn MetalDevice>,
    allocation_size: vk::DeviceSize,
    property_flags: vk::MemoryPropertyFlags,
    allocate_flags: vk::MemoryAllocateFlags,
    storage_mode: StorageMode,
    cache_mode: CpuCacheMode,
    is_dedicated: bool,
    is_host_memory_imported: bool,
    backing: BackingResource,
    heap_allocation: HeapAllocation,
    host_ptr: *mut c_void,
    staging: Option<HostStaging>,
    imported_host_ptr: *mut c_void,
    mapped_range: MappedMemoryRange,
    debug_name: Option<String>,
    bindings: Mutex<BindingSets>,
}

// The raw pointers refer to memory owned by this value (the staging
// shadow, or buffer contents kept alive through `backing`) or to
// caller-imported memory whose lifetime the caller guarantees. Concurrent
// access to mapped contents is the caller's contract.
unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl DeviceMemory {
    /// Allocate device memory.
    ///
    /// Classifies the storage and CPU cache mode from the requested flags
    /// and the device's capabilities. For a dedicated-image target the
    /// texture becomes the backing resource immediately; everything else
    /// is materialized on first use.
    pub fn new(
        device: Arc<dyn MetalDevice>,
        allocate_info: &DeviceMemoryAllocateInfo,
    ) -> Result<Self, MemoryError> {
        if allocate_info.allocation_size == 0 {
            return Err(MemoryError::InvalidRange {
                offset: 0,
                size: 0,
                allocation_size: 0,
            });
        }

        let mut storage_mode = derive_storage_mode(
            allocate_info.property_flags,
            device.capabilities(),
        );
        let cache_mode =
            derive_cpu_cache_mode(allocate_info.property_flags);

        let mut backing = BackingResource::None;
        if let Some(texture) = &allocate_info.dedicated_texture {
            // The texture's own mode wins over the requested flags.
            storage_mode = texture.storage_mode();
            backing = BackingResource::Texture(texture.clone());
        }

        let imported_host_ptr = allocate_info
            .imported_host_memory
            .map(NonNull::as_ptr)
            .unwrap_or(std::ptr::null_mut());

        log::trace!(
            "allocated {} bytes of device memory as {:?}/{:?}",
            allocate_info.allocation_size,
            storage_mode,
            cache_mode,
        );

        Ok(Self {
            device,
            allocation_size: allocate_info.allocation_size,
            property_flags: allocate_info.property_flags,
            allocate_flags: allocate_info.allocate_flags,
            storage_mode,
            cache_mode,
            is_dedicated: allocate_info.dedicated
                || allocate_info.dedicated_texture.is_some(),
            is_host_memory_imported: allocate_info
                .imported_host_memory
                .is_some(),
            backing,
            heap_allocation: HeapAllocation::default(),
            host_ptr: std::ptr::null_mut(),
            staging: None,
            imported_host_ptr,
            mapped_range: MappedMemoryRange::default(),
            debug_name: None,
            bindings: Mutex::new(BindingSets::default()),
        })
    }

    /// Whether the memory is accessible from the host. The storage mode
    /// decides; a host-visible flag request never overrides a private or
    /// memoryless mode.
    pub fn is_host_accessible(&self) -> bool {
        self.storage_mode.is_host_accessible()
    }

    /// Whether host and device observe each other's writes without
    /// explicit synchronization.
    pub fn is_host_coherent(&self) -> bool {
        self.storage_mode.is_host_coherent()
    }

    pub fn is_dedicated_allocation(&self) -> bool {
        self.is_dedicated
    }

    pub fn is_host_memory_imported(&self) -> bool {
        self.is_host_memory_imported
    }

    /// The memory already committed by this allocation.
    pub fn device_memory_commitment(&self) -> vk::DeviceSize {
        self.allocation_size
    }

    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.allocation_size
    }

    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.property_flags
    }

    pub fn allocate_flags(&self) -> vk::MemoryAllocateFlags {
        self.allocate_flags
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    pub fn cpu_cache_mode(&self) -> CpuCacheMode {
        self.cache_mode
    }

    pub fn resource_options(&self) -> ResourceOptions {
        ResourceOptions {
            storage_mode: self.storage_mode,
            cache_mode: self.cache_mode,
        }
    }

    /// The host address of this memory, or null if it has not been mapped
    /// yet or can never be mapped.
    pub fn host_memory_address(&self) -> *mut c_void {
        self.host_ptr
    }

    /// The range currently mapped to host memory, `{0,0}` when unmapped.
    pub fn mapped_range(&self) -> MappedMemoryRange {
        self.mapped_range
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_range.is_mapped()
    }

    /// The buffer face of this allocation, if one has been materialized.
    pub fn device_buffer(&self) -> Option<&Arc<dyn MetalBuffer>> {
        self.backing.buffer()
    }

    /// The texture face of this allocation, if it was created for a
    /// dedicated image.
    pub fn device_texture(&self) -> Option<&Arc<dyn MetalTexture>> {
        self.backing.texture()
    }

    /// The placement heap backing this allocation, when heap suballocation
    /// was chosen.
    pub fn heap(&self) -> Option<&Arc<dyn MetalHeap>> {
        self.heap_allocation.heap.as_ref()
    }

    pub(crate) fn device(&self) -> &Arc<dyn MetalDevice> {
        &self.device
    }

    /// Record a debug name and propagate it as the label of the backing
    /// heap, buffer, or texture, including backing created later.
    pub fn set_debug_name(&mut self, name: &str) {
        self.debug_name = Some(name.to_owned());
        self.propagate_debug_name();
    }

    pub(crate) fn propagate_debug_name(&self) {
        let Some(name) = self.debug_name.as_deref() else {
            return;
        };
        if let Some(heap) = self.heap_allocation.heap.as_ref() {
            heap.set_label(name);
        }
        match &self.backing {
            BackingResource::Buffer(buffer) => buffer.set_label(name),
            BackingResource::Texture(texture) => texture.set_label(name),
            BackingResource::None => {}
        }
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        // Freeing while bindings remain is a caller error; teardown stays
        // forgiving, so warn instead of panicking.
        if let Ok(sets) = self.bindings.lock() {
            if !sets.buffers.is_empty() || !sets.images.is_empty() {
                log::warn!(
                    "device memory freed with {} buffer and {} image \
                     bindings still attached",
                    sets.buffers.len(),
                    sets.images.len(),
                );
            }
        }
        self.free_host_memory();
        log::trace!(
            "freeing {} bytes of device memory",
            self.allocation_size
        );
    }
}
