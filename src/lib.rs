//! A Vulkan-style device memory layer for storage-mode based GPU runtimes.
//!
//! Vulkan applications allocate a pool of device memory, bind buffers and
//! images into subranges of it, map host pointers, and explicitly flush or
//! pull ranges when the memory is not coherent. Metal-shaped runtimes have
//! no such pool: every resource carries a storage mode that decides host
//! visibility and coherency up front, and suballocation only exists through
//! heap objects. This crate owns the translation between the two models: it
//! decides how an allocation is backed (direct buffer, dedicated texture,
//! heap carve, or a lazily-created host staging shadow), keeps the
//! mapped-range bookkeeping, and turns explicit flush/pull calls into the
//! storage-mode runtime's synchronization primitives.
//!
//! The runtime itself is reached through the traits in [`metal`]; a
//! host-memory reference implementation lives in [`metal::software`] for
//! tests and headless use.

pub mod device_memory;
pub mod logging;
pub mod metal;

pub use self::{
    device_memory::{
        BufferBinding, DedicatedResource, DeviceMemory,
        DeviceMemoryAllocateInfo, HeapAllocation, ImageBinding,
        MappedMemoryRange, MemoryError,
    },
    metal::{
        BlitEncoderHolder, CpuCacheMode, DeviceCapabilities, ResourceOptions,
        StorageMode,
    },
};
