use ash::vk;

use super::{DeviceMemory, MappedMemoryRange, MemoryError};
use crate::metal::BlitEncoderHolder;

impl DeviceMemory {
    /// Make host-side writes in the given range visible to the device.
    ///
    /// A no-op success for host-coherent storage. For managed storage with
    /// a buffer face, the range is marked dirty for device consumption;
    /// execution happens at the next command submission boundary. The
    /// range is clamped to the allocation rather than rejected.
    pub fn flush_to_device(
        &mut self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), MemoryError> {
        if !self.is_host_accessible() || self.is_host_coherent() {
            return Ok(());
        }
        let range = self.clamped_range(offset, size);
        if range.size == 0 {
            return Ok(());
        }
        if let Some(buffer) = self.backing.buffer() {
            buffer.did_modify_range(range.offset, range.size);
            log::trace!(
                "flushed device memory range at offset {} with size {}",
                range.offset,
                range.size,
            );
        }
        Ok(())
    }

    /// Make the most recent device-side writes in the given range visible
    /// to the host.
    ///
    /// A no-op success for host-coherent storage. Managed storage needs a
    /// GPU-side synchronization instruction: it is appended to the
    /// holder's encoder, and when the holder is empty an encoder and
    /// command buffer are created through the device and handed back in
    /// the holder. Ownership of the created pair transfers to the caller,
    /// who ends encoding, commits, and waits. Several pulls across several
    /// allocations can share one submission this way. The range is clamped
    /// to the allocation rather than rejected.
    ///
    /// # Errors
    ///
    /// * `ResourceBusy` when an encoder is required and none can be
    ///   obtained.
    pub fn pull_from_device(
        &mut self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        blit: &mut BlitEncoderHolder,
    ) -> Result<(), MemoryError> {
        if !self.is_host_accessible() || self.is_host_coherent() {
            return Ok(());
        }
        let range = self.clamped_range(offset, size);
        if range.size == 0 {
            return Ok(());
        }
        let Some(buffer) = self.backing.buffer().cloned() else {
            // Nothing materialized on the device yet, so there is nothing
            // newer than the host's copy.
            return Ok(());
        };
        if blit.is_empty() {
            let (encoder, command_buffer) =
                self.device().new_blit_encoder()?;
            blit.encoder = Some(encoder);
            blit.command_buffer = Some(command_buffer);
        }
        let encoder = blit.encoder.as_ref().ok_or(
            MemoryError::ResourceBusy {
                reason: "the encoder holder is missing an encoder",
            },
        )?;
        encoder.synchronize_buffer(buffer.as_ref(), range.offset, range.size);
        log::trace!(
            "queued a pull of device memory range at offset {} with size {}",
            range.offset,
            range.size,
        );
        Ok(())
    }

    /// Clamp a requested range to the allocation's legal bounds. The
    /// whole-size sentinel (or 0) extends to the end of the allocation.
    fn clamped_range(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> MappedMemoryRange {
        let allocation_size = self.allocation_size();
        let offset = offset.min(allocation_size);
        let size = if size == 0 || size == vk::WHOLE_SIZE {
            allocation_size - offset
        } else {
            size.min(allocation_size - offset)
        };
        MappedMemoryRange { offset, size }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk;

    use crate::{
        metal::software::{
            SoftwareBlitEncoder, SoftwareCommandBuffer, SoftwareDevice,
        },
        BlitEncoderHolder, DeviceCapabilities, DeviceMemory,
        DeviceMemoryAllocateInfo,
    };

    fn managed_memory(
        size: vk::DeviceSize,
    ) -> (Arc<SoftwareDevice>, DeviceMemory) {
        let device = Arc::new(SoftwareDevice::new(
            DeviceCapabilities::discrete_gpu(),
        ));
        let memory = DeviceMemory::new(
            device.clone(),
            &DeviceMemoryAllocateInfo::new(
                size,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_CACHED,
            ),
        )
        .unwrap();
        (device, memory)
    }

    #[test]
    fn coherent_memory_never_needs_an_encoder() {
        let device = Arc::new(SoftwareDevice::new(
            DeviceCapabilities::discrete_gpu(),
        ));
        let mut memory = DeviceMemory::new(
            device.clone(),
            &DeviceMemoryAllocateInfo::new(
                4096,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
            ),
        )
        .unwrap();

        memory.flush_to_device(0, vk::WHOLE_SIZE).unwrap();
        let mut holder = BlitEncoderHolder::default();
        memory.pull_from_device(0, vk::WHOLE_SIZE, &mut holder).unwrap();
        assert!(holder.is_empty());
        assert_eq!(device.encoders_created(), 0);
    }

    #[test]
    fn flush_marks_the_clamped_range_dirty() {
        let (device, mut memory) = managed_memory(4096);
        memory.ensure_buffer().unwrap();

        // Oversized request clamps to the allocation instead of failing.
        memory.flush_to_device(1024, 1_000_000).unwrap();

        let buffer = device.last_buffer().unwrap();
        assert_eq!(buffer.modified_ranges(), vec![(1024, 3072)]);
    }

    #[test]
    fn pull_populates_an_empty_holder_and_reuses_it() {
        let (device, mut memory) = managed_memory(4096);
        memory.ensure_buffer().unwrap();

        let mut holder = BlitEncoderHolder::default();
        memory.pull_from_device(0, 1024, &mut holder).unwrap();
        assert!(!holder.is_empty());
        assert!(holder.command_buffer.is_some());
        assert_eq!(device.encoders_created(), 1);

        let first_encoder = holder.encoder.clone().unwrap();
        memory.pull_from_device(1024, 1024, &mut holder).unwrap();
        assert!(Arc::ptr_eq(
            &first_encoder,
            holder.encoder.as_ref().unwrap()
        ));
        assert_eq!(device.encoders_created(), 1);
    }

    #[test]
    fn pull_appends_to_a_caller_supplied_encoder() {
        let (device, mut memory) = managed_memory(4096);
        memory.ensure_buffer().unwrap();

        let encoder = Arc::new(SoftwareBlitEncoder::default());
        let command_buffer = Arc::new(SoftwareCommandBuffer::default());
        let mut holder = BlitEncoderHolder {
            encoder: Some(encoder.clone()),
            command_buffer: Some(command_buffer),
        };

        memory.pull_from_device(0, 256, &mut holder).unwrap();
        memory.pull_from_device(256, 256, &mut holder).unwrap();

        assert_eq!(
            encoder.synchronized_ranges(),
            vec![(0, 256), (256, 256)]
        );
        assert_eq!(device.encoders_created(), 0);
    }

    #[test]
    fn encoder_exhaustion_is_resource_busy() {
        let (device, mut memory) = managed_memory(4096);
        memory.ensure_buffer().unwrap();
        device.deny_encoder_creation(true);

        let mut holder = BlitEncoderHolder::default();
        let result = memory.pull_from_device(0, 1024, &mut holder);
        assert!(matches!(
            result,
            Err(crate::MemoryError::ResourceBusy { .. })
        ));
    }
}
