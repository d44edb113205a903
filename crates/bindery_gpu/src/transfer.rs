//! Host to device copies.
//!
//! Every copy resolves its [`CopyRegion`] against both sizes first: a whole-size region covers
//! `min(destination, source)` bytes and an explicit size is clamped to the same bound, so a copy
//! never reads or writes past either end.

use crate::{
    command::CommandBuffer,
    error::{Error, Result}
};

use ash::vk;
use bevy_log::debug;


/// Copies up to the end of the destination or the source, whichever comes first.
pub const WHOLE_SIZE: vk::DeviceSize = vk::WHOLE_SIZE;

/// Writes `src` into `dst`. Both slices have the same length.
pub type CopyMemoryFn = fn(&mut [u8], &[u8]);

pub fn copy_memory(dst: &mut [u8], src: &[u8]) {
    dst.copy_from_slice(src);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: vk::DeviceSize,
    pub dst_offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl Default for CopyRegion {
    fn default() -> Self {
        Self {
            src_offset: 0,
            dst_offset: 0,
            size: WHOLE_SIZE,
        }
    }
}

impl CopyRegion {
    pub fn new(src_offset: vk::DeviceSize, dst_offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        Self { src_offset, dst_offset, size }
    }

    /// Region with an explicit byte count at offset zero on both sides.
    pub fn sized(size: vk::DeviceSize) -> Self {
        Self { size, ..Default::default() }
    }

    /// Clamps the region to a destination of `dst_size` and a source of `src_size` bytes.
    pub fn resolve(&self, dst_size: vk::DeviceSize, src_size: vk::DeviceSize) -> Result<Self> {
        if self.size == WHOLE_SIZE && self.dst_offset != 0 {
            return Err(Error::invalid_usage("whole-size copies must start at destination offset 0"));
        }
        if self.dst_offset > dst_size || self.src_offset > src_size {
            return Err(Error::invalid_usage("copy offset is out of range"));
        }

        let bound = (dst_size - self.dst_offset).min(src_size - self.src_offset);

        Ok(Self {
            size: self.size.min(bound),
            ..*self
        })
    }

    pub(crate) fn buffer_copy(&self) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset: self.src_offset,
            dst_offset: self.dst_offset,
            size: self.size,
        }
    }
}

/// Copies `region` of `src` into `dst` with `copy_fn`, or a plain byte copy.
pub(crate) fn copy_host_bytes(dst: &mut [u8], src: &[u8], copy_fn: Option<CopyMemoryFn>) {
    debug_assert_eq!(dst.len(), src.len());
    (copy_fn.unwrap_or(copy_memory))(dst, src);
}

/// Submits a recorded command buffer and blocks until it has executed.
///
/// Resets the command buffer's fence, submits to queue 0 of the buffer's queue family, waits on
/// the fence without a timeout and moves the command buffer out of the pending state.
pub fn finish(command_buffer: &mut CommandBuffer) -> Result<()> {
    let device = command_buffer.device().clone();
    let fence = command_buffer.fence().clone();
    let mut queue = device.queue_by_family(command_buffer.queue_family_index(), 0)?;

    fence.reset()?;
    queue.submit(command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE, None, None, Some(&fence))?;
    fence.wait()?;
    command_buffer.finished_execution()?;
    debug!("Finished command buffer {:?} on queue family {}", command_buffer.handle(), queue.family_index());

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_size_clamps_to_the_smaller_side() {
        let region = CopyRegion::default().resolve(256, 100).unwrap();
        assert_eq!(region.size, 100);

        let region = CopyRegion::default().resolve(64, 100).unwrap();
        assert_eq!(region.size, 64);
    }

    #[test]
    fn explicit_sizes_are_clamped_too() {
        let region = CopyRegion::new(0, 16, 1000).resolve(64, 100).unwrap();
        assert_eq!(region.size, 48);

        let region = CopyRegion::new(90, 0, 32).resolve(64, 100).unwrap();
        assert_eq!(region.size, 10);

        let region = CopyRegion::sized(8).resolve(64, 100).unwrap();
        assert_eq!(region.size, 8);
    }

    #[test]
    fn whole_size_requires_zero_destination_offset() {
        let region = CopyRegion { dst_offset: 4, ..Default::default() };
        assert!(matches!(region.resolve(64, 64), Err(Error::InvalidUsage(_))));
        assert!(matches!(CopyRegion::new(0, 65, 1).resolve(64, 64), Err(Error::InvalidUsage(_))));
    }

    #[test]
    fn resolving_is_idempotent() {
        let once = CopyRegion::default().resolve(100, 40).unwrap();
        assert_eq!(once.resolve(100, 40).unwrap(), once);
    }

    #[test]
    fn custom_copy_functions_are_used() {
        fn invert(dst: &mut [u8], src: &[u8]) {
            for (dst, src) in dst.iter_mut().zip(src) {
                *dst = !src;
            }
        }

        let mut dst = [0u8; 2];
        copy_host_bytes(&mut dst, &[0x0F, 0xF0], Some(invert));
        assert_eq!(dst, [0xF0, 0x0F]);
        copy_host_bytes(&mut dst, &[1, 2], None);
        assert_eq!(dst, [1, 2]);
    }
}
