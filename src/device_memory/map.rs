use std::{ffi::c_void, ptr::NonNull};

use ash::vk;

use super::{DeviceMemory, MappedMemoryRange, MemoryError};

impl DeviceMemory {
    /// Map the allocation at the given offset and return the host address
    /// of that offset.
    ///
    /// A `size` of 0 or [`vk::WHOLE_SIZE`] maps from `offset` to the end
    /// of the allocation. Mapping while already mapped replaces the mapped
    /// range and succeeds; synchronizing concurrent host access to the
    /// returned pointer is the application's job. The pointer stays valid
    /// until [`unmap`](Self::unmap) or destruction.
    ///
    /// # Errors
    ///
    /// * `MemoryMapFailed` when the storage mode has no host address
    ///   (private or memoryless), or the backing resource cannot produce
    ///   one.
    /// * `InvalidRange` when the requested window does not fit in the
    ///   allocation.
    pub fn map(
        &mut self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        _flags: vk::MemoryMapFlags,
    ) -> Result<NonNull<c_void>, MemoryError> {
        if !self.is_host_accessible() {
            return Err(MemoryError::MemoryMapFailed {
                reason: "the storage mode is not host accessible",
            });
        }

        let allocation_size = self.allocation_size();
        if offset >= allocation_size {
            return Err(MemoryError::InvalidRange {
                offset,
                size,
                allocation_size,
            });
        }
        let effective_size = if size == 0 || size == vk::WHOLE_SIZE {
            allocation_size - offset
        } else {
            size
        };
        let fits = offset
            .checked_add(effective_size)
            .map(|end| end <= allocation_size)
            .unwrap_or(false);
        if !fits {
            return Err(MemoryError::InvalidRange {
                offset,
                size,
                allocation_size,
            });
        }

        let base = self.realize_host_pointer()?;
        self.mapped_range = MappedMemoryRange {
            offset,
            size: effective_size,
        };
        log::trace!(
            "mapped device memory range at offset {} with size {}",
            offset,
            effective_size,
        );

        let mapped = unsafe {
            // In bounds: offset < allocation_size and the host pointer
            // spans the whole allocation.
            base.as_ptr().cast::<u8>().add(offset as usize)
        };
        NonNull::new(mapped.cast::<c_void>()).ok_or(
            MemoryError::MemoryMapFailed {
                reason: "the mapped address is null",
            },
        )
    }

    /// Unmap a previously mapped range.
    ///
    /// Non-coherent storage is flushed over the previously mapped range
    /// before the pointer is considered invalid. Unmapping when not mapped
    /// is a successful no-op, so teardown ordering stays forgiving.
    pub fn unmap(&mut self) -> Result<(), MemoryError> {
        if !self.mapped_range.is_mapped() {
            return Ok(());
        }
        if !self.is_host_coherent() {
            let range = self.mapped_range;
            self.flush_to_device(range.offset, range.size)?;
        }
        self.mapped_range = MappedMemoryRange::default();
        log::trace!("unmapped device memory");
        Ok(())
    }
}
