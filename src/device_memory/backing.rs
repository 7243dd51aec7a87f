use std::{cell::UnsafeCell, ffi::c_void, ptr::NonNull, sync::Arc};

use ash::vk;

use super::{BackingResource, DeviceMemory, HeapAllocation, MemoryError};
use crate::metal::MetalBuffer;

/// Host-side shadow storage for allocations whose device backing has no
/// host address of its own (the dedicated-texture case).
pub(crate) struct HostStaging {
    bytes: Box<[UnsafeCell<u8>]>,
}

impl HostStaging {
    fn new(size: usize) -> Result<Self, MemoryError> {
        let mut storage = Vec::new();
        storage.try_reserve_exact(size).map_err(|_| {
            MemoryError::OutOfHostMemory {
                size: size as vk::DeviceSize,
            }
        })?;
        storage.resize_with(size, || UnsafeCell::new(0u8));
        Ok(Self {
            bytes: storage.into_boxed_slice(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut c_void {
        self.bytes.as_ptr() as *mut c_void
    }
}

impl DeviceMemory {
    /// Request a placement heap sized to the whole allocation.
    ///
    /// Heaps co-locate small allocations; they are an optimization, not a
    /// correctness requirement, so failure here is non-fatal and the
    /// caller falls back to direct allocation. Returns whether a heap is
    /// available afterwards.
    pub(crate) fn ensure_heap(&mut self) -> bool {
        if self.heap_allocation.is_valid() {
            return true;
        }
        let capabilities = *self.device().capabilities();
        if !capabilities.prefers_placement_heaps
            || self.is_dedicated_allocation()
            || self.is_host_memory_imported()
        {
            return false;
        }
        match self
            .device()
            .new_heap(self.allocation_size(), self.resource_options())
        {
            Ok(heap) => {
                log::trace!(
                    "created a {} byte placement heap for device memory",
                    self.allocation_size(),
                );
                self.heap_allocation = HeapAllocation {
                    heap: Some(heap),
                    offset: 0,
                    size: self.allocation_size(),
                    align: capabilities.min_buffer_offset_alignment,
                };
                self.propagate_debug_name();
                true
            }
            Err(error) => {
                log::debug!(
                    "heap suballocation unavailable, falling back to a \
                     direct allocation: {}",
                    error,
                );
                false
            }
        }
    }

    /// Materialize the buffer face of this allocation.
    ///
    /// Idempotent. Carves the buffer from the placement heap when one is
    /// available, wraps imported host memory without copying, and falls
    /// back to a standalone buffer otherwise. A texture-backed allocation
    /// never grows a buffer face.
    pub(crate) fn ensure_buffer(&mut self) -> Result<(), MemoryError> {
        match &self.backing {
            BackingResource::Buffer(_) => return Ok(()),
            BackingResource::Texture(_) => {
                return Err(MemoryError::ResourceBusy {
                    reason: "the allocation is dedicated to a texture",
                })
            }
            BackingResource::None => {}
        }

        let options = self.resource_options();
        let size = self.allocation_size();

        let buffer: Arc<dyn MetalBuffer> = if let Some(imported) =
            NonNull::new(self.imported_host_ptr)
        {
            self.device()
                .new_buffer_with_host_memory(imported, size, options)?
        } else if self.ensure_heap() {
            let heap_allocation = self.heap_allocation.clone();
            let heap = heap_allocation
                .heap
                .as_ref()
                .ok_or(MemoryError::OutOfDeviceMemory { size })?;
            match heap.new_buffer(size, heap_allocation.offset, options) {
                Ok(buffer) => buffer,
                Err(error) => {
                    // Degrade to a direct allocation; only give up when
                    // that fails too. A directly backed allocation keeps
                    // no heap handle.
                    log::debug!(
                        "heap carve failed ({}), degrading to a direct \
                         buffer",
                        error,
                    );
                    self.heap_allocation = HeapAllocation::default();
                    self.device().new_buffer(size, options)?
                }
            }
        } else {
            self.device().new_buffer(size, options)?
        };

        log::trace!(
            "materialized a {} byte buffer face for device memory",
            size
        );
        self.backing = BackingResource::Buffer(buffer);
        self.propagate_debug_name();
        Ok(())
    }

    /// Lazily allocate the host staging shadow and return its address.
    pub(crate) fn ensure_host_memory(
        &mut self,
    ) -> Result<NonNull<c_void>, MemoryError> {
        if let Some(staging) = &self.staging {
            return NonNull::new(staging.as_mut_ptr()).ok_or(
                MemoryError::MemoryMapFailed {
                    reason: "the staging shadow has no address",
                },
            );
        }
        let staging = HostStaging::new(self.allocation_size() as usize)?;
        let ptr = staging.as_mut_ptr();
        log::trace!(
            "allocated a {} byte host staging shadow",
            staging.len()
        );
        self.staging = Some(staging);
        NonNull::new(ptr).ok_or(MemoryError::MemoryMapFailed {
            reason: "the staging shadow has no address",
        })
    }

    /// Release the staging shadow. Imported host memory is caller-owned
    /// and is never touched.
    pub(crate) fn free_host_memory(&mut self) {
        if let Some(staging) = self.staging.take() {
            if self.host_ptr == staging.as_mut_ptr() {
                self.host_ptr = std::ptr::null_mut();
            }
            log::trace!(
                "released a {} byte host staging shadow",
                staging.len()
            );
        }
    }

    /// Realize the host pointer on first need.
    ///
    /// Imported memory wins, then the buffer face's own host address, then
    /// the staging shadow for texture-backed allocations. An allocation
    /// with no face yet gets its buffer face created here, since mapping
    /// counts as a first use.
    pub(crate) fn realize_host_pointer(
        &mut self,
    ) -> Result<NonNull<c_void>, MemoryError> {
        if let Some(ptr) = NonNull::new(self.host_ptr) {
            return Ok(ptr);
        }
        if let Some(imported) = NonNull::new(self.imported_host_ptr) {
            self.host_ptr = imported.as_ptr();
            return Ok(imported);
        }
        if matches!(self.backing, BackingResource::None) {
            self.ensure_buffer()?;
        }
        let ptr = match &self.backing {
            BackingResource::Buffer(buffer) => {
                NonNull::new(buffer.contents()).ok_or(
                    MemoryError::MemoryMapFailed {
                        reason: "the backing buffer has no host address",
                    },
                )?
            }
            BackingResource::Texture(_) => self.ensure_host_memory()?,
            BackingResource::None => {
                return Err(MemoryError::MemoryMapFailed {
                    reason: "the allocation has no backing resource",
                })
            }
        };
        self.host_ptr = ptr.as_ptr();
        Ok(ptr)
    }
}
