//! The storage-mode runtime interface this crate sits on top of.
//!
//! The owning device, its resources, and its command encoders are external
//! collaborators: this crate reads them through the traits below but never
//! owns their lifetimes. A host-memory reference implementation is provided
//! in [`software`] for tests and headless consumers.

pub mod software;

use std::{ffi::c_void, ptr::NonNull, sync::Arc};

use ash::vk;

use crate::device_memory::MemoryError;

/// The storage mode of a runtime resource. Decides host visibility and
/// coherency for everything placed in that resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// Host and device share one coherent view of the memory.
    Shared,

    /// Host and device each have a copy; changes must be synchronized
    /// explicitly in both directions.
    Managed,

    /// Device-only memory with no host address.
    Private,

    /// Transient device memory with no backing store at all.
    Memoryless,
}

impl StorageMode {
    /// Whether resources with this mode have a host-visible address.
    pub fn is_host_accessible(self) -> bool {
        !matches!(self, Self::Private | Self::Memoryless)
    }

    /// Whether host writes and device writes are visible to each other
    /// without explicit synchronization.
    pub fn is_host_coherent(self) -> bool {
        matches!(self, Self::Shared)
    }
}

/// The CPU cache mode of a runtime resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuCacheMode {
    DefaultCache,

    /// Optimized for CPU writes which are never read back on the CPU.
    WriteCombined,
}

/// The pair of resource attributes every buffer, texture, and heap carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceOptions {
    pub storage_mode: StorageMode,
    pub cache_mode: CpuCacheMode,
}

/// Platform-tier inputs to the storage-mode mapping table.
///
/// These are a given parameter of the device's memory-type table; choosing
/// them is policy that lives outside this crate.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCapabilities {
    /// Whether the platform has a managed (two-copy, explicitly
    /// synchronized) storage mode at all.
    pub supports_managed_memory: bool,

    /// Whether the platform supports memoryless transient resources.
    pub supports_memoryless: bool,

    /// Whether the platform wants allocations to be co-located in
    /// placement heaps when possible.
    pub prefers_placement_heaps: bool,

    /// Minimum alignment for a buffer's offset within a heap or
    /// allocation.
    pub min_buffer_offset_alignment: vk::DeviceSize,
}

impl DeviceCapabilities {
    /// A discrete-GPU tier: managed memory, no memoryless resources.
    pub fn discrete_gpu() -> Self {
        Self {
            supports_managed_memory: true,
            supports_memoryless: false,
            prefers_placement_heaps: false,
            min_buffer_offset_alignment: 256,
        }
    }

    /// A unified-memory tier: no managed mode, memoryless transients, and
    /// placement heaps preferred.
    pub fn unified_memory() -> Self {
        Self {
            supports_managed_memory: false,
            supports_memoryless: true,
            prefers_placement_heaps: true,
            min_buffer_offset_alignment: 16,
        }
    }
}

/// The storage-mode mapping table: requested Vulkan property flags plus the
/// platform tier decide the storage mode of the backing resource.
///
/// The runtime's resource model takes precedence over the request: a
/// lazily-allocated or device-local-only request can come back memoryless
/// even though the flags nominally permit host access elsewhere.
pub fn derive_storage_mode(
    flags: vk::MemoryPropertyFlags,
    capabilities: &DeviceCapabilities,
) -> StorageMode {
    if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        let lazily_allocated =
            flags.contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED);
        let device_local_only =
            flags == vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let forced_memoryless = device_local_only
            && !capabilities.supports_managed_memory;
        if capabilities.supports_memoryless
            && (lazily_allocated || forced_memoryless)
        {
            return StorageMode::Memoryless;
        }
        return StorageMode::Private;
    }
    if flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
        return StorageMode::Shared;
    }
    if capabilities.supports_managed_memory {
        StorageMode::Managed
    } else {
        // Platforms without a managed mode keep host-visible memory in the
        // shared, coherent mode.
        StorageMode::Shared
    }
}

/// Derive the CPU cache mode from the requested Vulkan property flags.
pub fn derive_cpu_cache_mode(
    flags: vk::MemoryPropertyFlags,
) -> CpuCacheMode {
    let host_visible = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
    let host_cached = flags.contains(vk::MemoryPropertyFlags::HOST_CACHED);
    if host_visible && !host_cached {
        CpuCacheMode::WriteCombined
    } else {
        CpuCacheMode::DefaultCache
    }
}

/// The owning logical device. Capability queries and resource creation go
/// through this interface; nothing behind it is owned by this crate.
pub trait MetalDevice: Send + Sync {
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Create a standalone buffer of the given length.
    fn new_buffer(
        &self,
        length: vk::DeviceSize,
        options: ResourceOptions,
    ) -> Result<Arc<dyn MetalBuffer>, MemoryError>;

    /// Create a buffer that wraps caller-owned host memory without copying.
    ///
    /// The caller keeps ownership of the memory and must keep it alive and
    /// unmoved for the lifetime of the returned buffer.
    fn new_buffer_with_host_memory(
        &self,
        host_memory: NonNull<c_void>,
        length: vk::DeviceSize,
        options: ResourceOptions,
    ) -> Result<Arc<dyn MetalBuffer>, MemoryError>;

    /// Create a placement heap from which buffers can later be carved.
    fn new_heap(
        &self,
        size: vk::DeviceSize,
        options: ResourceOptions,
    ) -> Result<Arc<dyn MetalHeap>, MemoryError>;

    /// Open a blit encoder on a fresh command buffer.
    ///
    /// Ownership of both transfers to the caller, who decides when to end
    /// encoding, commit, and wait.
    fn new_blit_encoder(
        &self,
    ) -> Result<
        (Arc<dyn BlitCommandEncoder>, Arc<dyn CommandBuffer>),
        MemoryError,
    >;
}

/// A buffer-shaped runtime resource.
pub trait MetalBuffer: Send + Sync {
    fn length(&self) -> vk::DeviceSize;

    /// The buffer's host address, or null when its storage mode has no
    /// host-visible address.
    fn contents(&self) -> *mut c_void;

    /// Notify the runtime that the host modified the given byte range, so
    /// device reads observe it. Only meaningful for managed storage.
    fn did_modify_range(&self, offset: vk::DeviceSize, size: vk::DeviceSize);

    fn storage_mode(&self) -> StorageMode;

    /// Offset of this buffer within its heap; zero for standalone buffers.
    fn heap_offset(&self) -> vk::DeviceSize;

    fn set_label(&self, label: &str);
}

/// A texture-shaped runtime resource. Opaque to this crate beyond its
/// storage mode; shape and layout belong to the image layer.
pub trait MetalTexture: Send + Sync {
    fn storage_mode(&self) -> StorageMode;

    fn set_label(&self, label: &str);
}

/// A placement heap: a shared pool that buffers are carved out of at
/// explicit offsets.
pub trait MetalHeap: Send + Sync {
    fn size(&self) -> vk::DeviceSize;

    fn resource_options(&self) -> ResourceOptions;

    /// Carve a buffer out of the heap at the given offset.
    fn new_buffer(
        &self,
        length: vk::DeviceSize,
        offset: vk::DeviceSize,
        options: ResourceOptions,
    ) -> Result<Arc<dyn MetalBuffer>, MemoryError>;

    fn set_label(&self, label: &str);
}

/// An open blit encoder used for device-to-host synchronization of managed
/// resources.
pub trait BlitCommandEncoder: Send + Sync {
    /// Append an instruction making the most recent device-side writes to
    /// the given byte range visible to the host.
    fn synchronize_buffer(
        &self,
        buffer: &dyn MetalBuffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    );

    fn end_encoding(&self);
}

/// The command buffer an encoder records into. Committing and waiting are
/// the caller's job; this crate never submits.
pub trait CommandBuffer: Send + Sync {
    fn commit(&self);
}

/// A holder for a blit encoder and its command buffer, so several pull
/// operations across several allocations can share one submission.
///
/// Callers hand an empty holder to the first
/// [`pull_from_device`](crate::DeviceMemory::pull_from_device) call, which
/// populates it; later calls append to the same encoder. The caller then
/// ends encoding, commits, and waits.
#[derive(Default, Clone)]
pub struct BlitEncoderHolder {
    pub encoder: Option<Arc<dyn BlitCommandEncoder>>,
    pub command_buffer: Option<Arc<dyn CommandBuffer>>,
}

impl BlitEncoderHolder {
    /// True when no encoder has been populated yet.
    pub fn is_empty(&self) -> bool {
        self.encoder.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(
        flags: vk::MemoryPropertyFlags,
        capabilities: &DeviceCapabilities,
    ) -> StorageMode {
        derive_storage_mode(flags, capabilities)
    }

    #[test]
    fn host_coherent_memory_is_shared() {
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(
            mode(flags, &DeviceCapabilities::discrete_gpu()),
            StorageMode::Shared
        );
        assert_eq!(
            mode(flags, &DeviceCapabilities::unified_memory()),
            StorageMode::Shared
        );
    }

    #[test]
    fn host_visible_non_coherent_memory_is_managed_where_supported() {
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_CACHED;
        assert_eq!(
            mode(flags, &DeviceCapabilities::discrete_gpu()),
            StorageMode::Managed
        );
        assert_eq!(
            mode(flags, &DeviceCapabilities::unified_memory()),
            StorageMode::Shared
        );
    }

    #[test]
    fn lazily_allocated_memory_is_memoryless_where_supported() {
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
        assert_eq!(
            mode(flags, &DeviceCapabilities::unified_memory()),
            StorageMode::Memoryless
        );
        assert_eq!(
            mode(flags, &DeviceCapabilities::discrete_gpu()),
            StorageMode::Private
        );
    }

    #[test]
    fn device_local_only_is_forced_memoryless_without_managed_support() {
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(
            mode(flags, &DeviceCapabilities::unified_memory()),
            StorageMode::Memoryless
        );
        assert_eq!(
            mode(flags, &DeviceCapabilities::discrete_gpu()),
            StorageMode::Private
        );
    }

    #[test]
    fn host_visible_uncached_memory_is_write_combined() {
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(
            derive_cpu_cache_mode(flags),
            CpuCacheMode::WriteCombined
        );
        assert_eq!(
            derive_cpu_cache_mode(
                flags | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            CpuCacheMode::DefaultCache
        );
        assert_eq!(
            derive_cpu_cache_mode(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            CpuCacheMode::DefaultCache
        );
    }
}
