//! Per-device registry of live native objects.
//!
//! Every owning handle registers a [`Footprint`] at creation and removes it on destruction. The
//! pool only observes: it keeps weak references, so it never extends an object's lifetime.

use ash::vk;
use bevy_log::warn;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak
    }
};


/// Metadata the owning object reports about itself.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ObjectDetail {
    /// Size of the bound (or, for memory objects, allocated) device memory.
    pub memory_size: vk::DeviceSize,
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Image type and array layer count.
    pub image: Option<(vk::ImageType, u32)>,
}

/// The pool's view of one live handle.
pub struct Footprint {
    object_type: vk::ObjectType,
    handle: AtomicU64,
    detail: Mutex<ObjectDetail>,
}

impl Footprint {
    pub(crate) fn new(object_type: vk::ObjectType, handle: u64) -> Arc<Self> {
        Arc::new(Self {
            object_type,
            handle: AtomicU64::new(handle),
            detail: Mutex::new(ObjectDetail::default()),
        })
    }

    pub fn object_type(&self) -> vk::ObjectType {
        self.object_type
    }

    pub fn handle(&self) -> u64 {
        self.handle.load(Ordering::Acquire)
    }

    pub fn detail(&self) -> ObjectDetail {
        *self.lock_detail()
    }

    pub(crate) fn set_handle(&self, handle: u64) {
        self.handle.store(handle, Ordering::Release);
    }

    pub(crate) fn update(&self, update: impl FnOnce(&mut ObjectDetail)) {
        update(&mut self.lock_detail());
    }

    fn lock_detail(&self) -> MutexGuard<'_, ObjectDetail> {
        self.detail.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Point-in-time object counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceResources {
    pub semaphore_count: u32,
    pub fence_count: u32,
    pub device_memory_count: u32,
    pub buffer_count: u32,
    pub image_1d_count: u32,
    pub image_1d_array_count: u32,
    pub image_2d_count: u32,
    pub image_2d_array_count: u32,
    pub image_3d_count: u32,
    pub command_pool_count: u32,
    pub acceleration_structure_count: u32,
}

type Bucket = HashMap<usize, Weak<Footprint>>;

#[derive(Default)]
pub struct ResourcePool {
    buckets: Mutex<HashMap<vk::ObjectType, Bucket>>,
}

impl ResourcePool {
    fn lock(&self) -> MutexGuard<'_, HashMap<vk::ObjectType, Bucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(&self, footprint: &Arc<Footprint>) {
        self.lock()
            .entry(footprint.object_type)
            .or_default()
            .insert(Arc::as_ptr(footprint) as usize, Arc::downgrade(footprint));
    }

    pub(crate) fn unregister(&self, footprint: &Footprint) {
        let key = footprint as *const Footprint as usize;
        let mut buckets = self.lock();
        let removed = buckets.get_mut(&footprint.object_type)
            .and_then(|bucket| bucket.remove(&key));
        if removed.is_none() {
            warn!("Unregistering unknown {:?} {:#x}", footprint.object_type, footprint.handle());
        }
    }

    /// Visits the live objects of one category under the pool lock.
    fn for_each(&self, object_type: vk::ObjectType, mut visit: impl FnMut(&Footprint)) {
        let buckets = self.lock();
        let Some(bucket) = buckets.get(&object_type) else {
            return;
        };
        for footprint in bucket.values().filter_map(Weak::upgrade) {
            visit(&footprint);
        }
    }

    pub fn count(&self, object_type: vk::ObjectType) -> usize {
        self.lock().get(&object_type).map_or(0, HashMap::len)
    }

    pub fn count_resources(&self) -> DeviceResources {
        let count = |object_type| self.count(object_type) as u32;
        let mut resources = DeviceResources {
            semaphore_count: count(vk::ObjectType::SEMAPHORE),
            fence_count: count(vk::ObjectType::FENCE),
            device_memory_count: count(vk::ObjectType::DEVICE_MEMORY),
            buffer_count: count(vk::ObjectType::BUFFER),
            command_pool_count: count(vk::ObjectType::COMMAND_POOL),
            acceleration_structure_count: count(vk::ObjectType::ACCELERATION_STRUCTURE_KHR),
            ..Default::default()
        };
        self.for_each(vk::ObjectType::IMAGE, |image| match image.detail().image {
            Some((vk::ImageType::TYPE_1D, 1)) => resources.image_1d_count += 1,
            Some((vk::ImageType::TYPE_1D, _)) => resources.image_1d_array_count += 1,
            Some((vk::ImageType::TYPE_2D, 1)) => resources.image_2d_count += 1,
            Some((vk::ImageType::TYPE_2D, _)) => resources.image_2d_array_count += 1,
            Some((vk::ImageType::TYPE_3D, _)) => resources.image_3d_count += 1,
            _ => ()
        });

        resources
    }

    fn memory_allocated(&self, required: vk::MemoryPropertyFlags) -> vk::DeviceSize {
        let mut size = 0;
        self.for_each(vk::ObjectType::DEVICE_MEMORY, |memory| {
            let detail = memory.detail();
            if detail.memory_flags.contains(required) {
                size += detail.memory_size;
            }
        });

        size
    }

    pub fn device_local_memory_allocated(&self) -> vk::DeviceSize {
        self.memory_allocated(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    pub fn host_visible_memory_allocated(&self) -> vk::DeviceSize {
        self.memory_allocated(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Device-local memory the host can write directly.
    pub fn resizable_bar_memory_allocated(&self) -> vk::DeviceSize {
        self.memory_allocated(
            vk::MemoryPropertyFlags::DEVICE_LOCAL |
            vk::MemoryPropertyFlags::HOST_VISIBLE |
            vk::MemoryPropertyFlags::HOST_COHERENT
        )
    }

    fn footprint(&self, object_type: vk::ObjectType) -> vk::DeviceSize {
        let mut size = 0;
        self.for_each(object_type, |object| size += object.detail().memory_size);
        size
    }

    pub fn buffer_memory_footprint(&self) -> vk::DeviceSize {
        self.footprint(vk::ObjectType::BUFFER)
    }

    pub fn image_memory_footprint(&self) -> vk::DeviceSize {
        self.footprint(vk::ObjectType::IMAGE)
    }

    pub fn acceleration_structure_memory_footprint(&self) -> vk::DeviceSize {
        self.footprint(vk::ObjectType::ACCELERATION_STRUCTURE_KHR)
    }

    pub fn has_unreleased_resources(&self) -> bool {
        self.lock().values().any(|bucket| !bucket.is_empty())
    }

    /// Categories with live objects and their counts.
    pub fn unreleased(&self) -> Vec<(vk::ObjectType, usize)> {
        self.lock().iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(&object_type, bucket)| (object_type, bucket.len()))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_paired() {
        let pool = ResourcePool::default();
        let buffers: Vec<_> = (0..3)
            .map(|handle| Footprint::new(vk::ObjectType::BUFFER, handle))
            .collect();
        let fence = Footprint::new(vk::ObjectType::FENCE, 9);
        buffers.iter().chain(Some(&fence)).for_each(|footprint| pool.register(footprint));

        assert_eq!(pool.count(vk::ObjectType::BUFFER), 3);
        pool.unregister(&buffers[1]);
        pool.unregister(&fence);
        assert_eq!(pool.count_resources().buffer_count, 2);
        assert_eq!(pool.count_resources().fence_count, 0);
        assert!(pool.has_unreleased_resources());

        pool.unregister(&buffers[0]);
        pool.unregister(&buffers[2]);
        assert!(!pool.has_unreleased_resources());
        assert!(pool.unreleased().is_empty());
    }

    #[test]
    fn images_are_classified_by_their_own_detail() {
        let pool = ResourcePool::default();
        let images: Vec<_> = [
            (vk::ImageType::TYPE_1D, 1),
            (vk::ImageType::TYPE_2D, 1),
            (vk::ImageType::TYPE_2D, 6),
            (vk::ImageType::TYPE_3D, 1),
        ]
        .into_iter()
        .enumerate()
        .map(|(handle, image)| {
            let footprint = Footprint::new(vk::ObjectType::IMAGE, handle as u64);
            footprint.update(|detail| detail.image = Some(image));
            pool.register(&footprint);
            footprint
        })
        .collect();

        let resources = pool.count_resources();
        assert_eq!(resources.image_1d_count, 1);
        assert_eq!(resources.image_1d_array_count, 0);
        assert_eq!(resources.image_2d_count, 1);
        assert_eq!(resources.image_2d_array_count, 1);
        assert_eq!(resources.image_3d_count, 1);
        drop(images);
    }

    #[test]
    fn memory_aggregates_filter_by_flags() {
        let pool = ResourcePool::default();
        let blocks: Vec<_> = [
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 1024),
            (vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT, 256),
            (
                vk::MemoryPropertyFlags::DEVICE_LOCAL |
                vk::MemoryPropertyFlags::HOST_VISIBLE |
                vk::MemoryPropertyFlags::HOST_COHERENT,
                64
            ),
        ]
        .into_iter()
        .enumerate()
        .map(|(handle, (flags, size))| {
            let footprint = Footprint::new(vk::ObjectType::DEVICE_MEMORY, handle as u64);
            footprint.update(|detail| {
                detail.memory_flags = flags;
                detail.memory_size = size;
            });
            pool.register(&footprint);
            footprint
        })
        .collect();

        assert_eq!(pool.device_local_memory_allocated(), 1088);
        assert_eq!(pool.host_visible_memory_allocated(), 320);
        assert_eq!(pool.resizable_bar_memory_allocated(), 64);
        assert_eq!(blocks.len(), 3);
    }
}
