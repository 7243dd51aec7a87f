use std::sync::Arc;

use ash::vk;

use super::{
    BufferBinding, DedicatedResource, DeviceMemory, ImageBinding,
    MemoryError,
};

impl DeviceMemory {
    /// Record a buffer binding sharing this allocation.
    ///
    /// Materializes the buffer face first, then validates the binding's
    /// range and alignment against the backing resource. The add is
    /// atomic: on any failure the binding sets are left unmodified.
    ///
    /// # Errors
    ///
    /// * `InvalidRange` when the binding's range does not fit in the
    ///   allocation.
    /// * `ResourceBusy` when the allocation is dedicated to a texture.
    /// * `OutOfDeviceMemory` when no buffer face could be materialized.
    /// * `MisalignedBinding` when the binding's offset violates the
    ///   required alignment.
    pub fn add_buffer(
        &mut self,
        buffer: Arc<dyn BufferBinding>,
    ) -> Result<(), MemoryError> {
        let offset = buffer.memory_offset();
        let size = buffer.byte_size();
        self.check_binding_range(offset, size)?;

        self.ensure_buffer()?;

        let alignment = self
            .device()
            .capabilities()
            .min_buffer_offset_alignment
            .max(self.heap_allocation.align)
            .max(buffer.required_memory_alignment())
            .max(1);
        if offset % alignment != 0 {
            return Err(MemoryError::MisalignedBinding { offset, alignment });
        }

        let mut sets = self
            .bindings
            .lock()
            .expect("unable to acquire the bindings lock");
        let already_present = sets
            .buffers
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &buffer));
        if !already_present {
            sets.buffers.push(buffer);
        }
        Ok(())
    }

    /// Remove a buffer binding. Removing one that was never added is a
    /// successful no-op.
    pub fn remove_buffer(&self, buffer: &Arc<dyn BufferBinding>) {
        let mut sets = self
            .bindings
            .lock()
            .expect("unable to acquire the bindings lock");
        sets.buffers
            .retain(|existing| !Arc::ptr_eq(existing, buffer));
    }

    /// Record an image memory binding sharing this allocation.
    ///
    /// # Errors
    ///
    /// * `InvalidRange` when the binding's range does not fit in the
    ///   allocation.
    /// * `MisalignedBinding` when the binding's offset violates its
    ///   required alignment.
    pub fn add_image_binding(
        &mut self,
        image: Arc<dyn ImageBinding>,
    ) -> Result<(), MemoryError> {
        let offset = image.memory_offset();
        let size = image.byte_size();
        self.check_binding_range(offset, size)?;

        let alignment = image
            .required_memory_alignment()
            .max(self.heap_allocation.align)
            .max(1);
        if offset % alignment != 0 {
            return Err(MemoryError::MisalignedBinding { offset, alignment });
        }

        let mut sets = self
            .bindings
            .lock()
            .expect("unable to acquire the bindings lock");
        let already_present = sets
            .images
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &image));
        if !already_present {
            sets.images.push(image);
        }
        Ok(())
    }

    /// Remove an image memory binding. Removing one that was never added
    /// is a successful no-op.
    pub fn remove_image_binding(&self, image: &Arc<dyn ImageBinding>) {
        let mut sets = self
            .bindings
            .lock()
            .expect("unable to acquire the bindings lock");
        sets.images
            .retain(|existing| !Arc::ptr_eq(existing, image));
    }

    /// The number of buffer and image bindings currently sharing this
    /// allocation.
    pub fn binding_counts(&self) -> (usize, usize) {
        let sets = self
            .bindings
            .lock()
            .expect("unable to acquire the bindings lock");
        (sets.buffers.len(), sets.images.len())
    }

    /// The single implicit resource of a dedicated allocation, used when
    /// exporting the backing object. `None` for non-dedicated allocations
    /// or before the resource has bound itself.
    pub fn dedicated_resource(&self) -> Option<DedicatedResource> {
        if !self.is_dedicated_allocation() {
            return None;
        }
        let sets = self
            .bindings
            .lock()
            .expect("unable to acquire the bindings lock");
        if let Some(buffer) = sets.buffers.first() {
            return Some(DedicatedResource::Buffer(buffer.clone()));
        }
        sets.images
            .first()
            .map(|image| DedicatedResource::Image(image.clone()))
    }

    fn check_binding_range(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), MemoryError> {
        let allocation_size = self.allocation_size();
        let fits = offset
            .checked_add(size)
            .map(|end| end <= allocation_size)
            .unwrap_or(false);
        if !fits {
            return Err(MemoryError::InvalidRange {
                offset,
                size,
                allocation_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk;

    use super::*;
    use crate::{
        metal::software::SoftwareDevice, DeviceCapabilities,
        DeviceMemoryAllocateInfo,
    };

    struct TestBinding {
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    }

    impl BufferBinding for TestBinding {
        fn memory_offset(&self) -> vk::DeviceSize {
            self.offset
        }

        fn byte_size(&self) -> vk::DeviceSize {
            self.size
        }

        fn required_memory_alignment(&self) -> vk::DeviceSize {
            self.alignment
        }
    }

    impl ImageBinding for TestBinding {
        fn memory_offset(&self) -> vk::DeviceSize {
            self.offset
        }

        fn byte_size(&self) -> vk::DeviceSize {
            self.size
        }

        fn required_memory_alignment(&self) -> vk::DeviceSize {
            self.alignment
        }
    }

    fn shared_memory(size: vk::DeviceSize) -> DeviceMemory {
        let device = Arc::new(SoftwareDevice::new(
            DeviceCapabilities::discrete_gpu(),
        ));
        DeviceMemory::new(
            device,
            &DeviceMemoryAllocateInfo::new(
                size,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        )
        .unwrap()
    }

    #[test]
    fn misaligned_buffer_binding_is_rejected_without_side_effects() {
        let mut memory = shared_memory(4096);
        let binding: Arc<dyn BufferBinding> = Arc::new(TestBinding {
            offset: 128,
            size: 256,
            alignment: 256,
        });

        let result = memory.add_buffer(binding);
        assert!(matches!(
            result,
            Err(MemoryError::MisalignedBinding {
                offset: 128,
                alignment: 256
            })
        ));
        assert_eq!(memory.binding_counts(), (0, 0));
    }

    #[test]
    fn out_of_bounds_binding_is_rejected() {
        let mut memory = shared_memory(4096);
        let binding: Arc<dyn BufferBinding> = Arc::new(TestBinding {
            offset: 4096,
            size: 256,
            alignment: 1,
        });

        let result = memory.add_buffer(binding);
        assert!(matches!(result, Err(MemoryError::InvalidRange { .. })));
        assert_eq!(memory.binding_counts(), (0, 0));
    }

    #[test]
    fn adding_a_buffer_materializes_the_buffer_face() {
        let mut memory = shared_memory(4096);
        assert!(memory.device_buffer().is_none());

        let binding: Arc<dyn BufferBinding> = Arc::new(TestBinding {
            offset: 0,
            size: 4096,
            alignment: 256,
        });
        memory.add_buffer(binding).unwrap();

        assert!(memory.device_buffer().is_some());
        assert_eq!(memory.binding_counts(), (1, 0));
    }

    #[test]
    fn adding_the_same_buffer_twice_records_it_once() {
        let mut memory = shared_memory(4096);
        let binding: Arc<dyn BufferBinding> = Arc::new(TestBinding {
            offset: 0,
            size: 256,
            alignment: 1,
        });

        memory.add_buffer(binding.clone()).unwrap();
        memory.add_buffer(binding).unwrap();
        assert_eq!(memory.binding_counts(), (1, 0));
    }

    #[test]
    fn removing_an_absent_binding_is_a_no_op() {
        let mut memory = shared_memory(4096);
        let bound: Arc<dyn BufferBinding> = Arc::new(TestBinding {
            offset: 0,
            size: 256,
            alignment: 1,
        });
        let never_bound: Arc<dyn BufferBinding> = Arc::new(TestBinding {
            offset: 512,
            size: 256,
            alignment: 1,
        });

        memory.add_buffer(bound).unwrap();
        memory.remove_buffer(&never_bound);
        assert_eq!(memory.binding_counts(), (1, 0));

        let never_bound_image: Arc<dyn ImageBinding> =
            Arc::new(TestBinding {
                offset: 0,
                size: 256,
                alignment: 1,
            });
        memory.remove_image_binding(&never_bound_image);
        assert_eq!(memory.binding_counts(), (1, 0));
    }

    #[test]
    fn image_bindings_share_an_allocation_with_their_own_alignment() {
        let mut memory = shared_memory(4096);
        let image: Arc<dyn ImageBinding> = Arc::new(TestBinding {
            offset: 1024,
            size: 1024,
            alignment: 512,
        });

        memory.add_image_binding(image.clone()).unwrap();
        assert_eq!(memory.binding_counts(), (0, 1));

        memory.remove_image_binding(&image);
        assert_eq!(memory.binding_counts(), (0, 0));
    }

    #[test]
    fn dedicated_resource_is_none_for_non_dedicated_allocations() {
        let mut memory = shared_memory(4096);
        let binding: Arc<dyn BufferBinding> = Arc::new(TestBinding {
            offset: 0,
            size: 4096,
            alignment: 1,
        });
        memory.add_buffer(binding).unwrap();
        assert!(memory.dedicated_resource().is_none());
    }
}
