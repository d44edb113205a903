//! Host allocation callbacks and the device sub-allocation seam.

pub mod managed;

use crate::{driver::BindTarget, error::Result, memory::MemoryRequirements};

use ash::vk;
use bevy_log::{debug, warn};

use std::{
    alloc::{self, Layout},
    collections::HashMap,
    ffi::c_void,
    ptr::NonNull,
    sync::{Arc, RwLock}
};


/// Host memory allocator handed to the driver through `VkAllocationCallbacks`.
///
/// An object must be destroyed with the same callbacks it was created with; owning handles store
/// the allocator next to the native handle for that reason.
pub trait HostAllocator: Send + Sync {
    fn alloc(&self, size: usize, alignment: usize, scope: vk::SystemAllocationScope) -> *mut c_void;
    fn realloc(&self, original: *mut c_void, size: usize, alignment: usize, scope: vk::SystemAllocationScope) -> *mut c_void;
    fn free(&self, memory: *mut c_void);

    fn internal_allocation_notification(&self, _size: usize, _kind: vk::InternalAllocationType, _scope: vk::SystemAllocationScope) {}
    fn internal_free_notification(&self, _size: usize, _kind: vk::InternalAllocationType, _scope: vk::SystemAllocationScope) {}

    /// Callbacks dispatching to `self`, usually [`host_callbacks`]`(self)`.
    fn callbacks(&self) -> vk::AllocationCallbacks<'_>;
}

/// Builds callbacks whose user data is `allocator` itself.
pub fn host_callbacks<A: HostAllocator>(allocator: &A) -> vk::AllocationCallbacks<'_> {
    vk::AllocationCallbacks::default()
        .user_data(allocator as *const A as *mut c_void)
        .pfn_allocation(Some(allocation::<A>))
        .pfn_reallocation(Some(reallocation::<A>))
        .pfn_free(Some(free::<A>))
        .pfn_internal_allocation(Some(internal_allocation::<A>))
        .pfn_internal_free(Some(internal_free::<A>))
}

unsafe extern "system" fn allocation<A: HostAllocator>(
    user_data: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope
) -> *mut c_void {
    (*(user_data as *const A)).alloc(size, alignment, scope)
}

unsafe extern "system" fn reallocation<A: HostAllocator>(
    user_data: *mut c_void,
    original: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope
) -> *mut c_void {
    (*(user_data as *const A)).realloc(original, size, alignment, scope)
}

unsafe extern "system" fn free<A: HostAllocator>(user_data: *mut c_void, memory: *mut c_void) {
    (*(user_data as *const A)).free(memory)
}

unsafe extern "system" fn internal_allocation<A: HostAllocator>(
    user_data: *mut c_void,
    size: usize,
    kind: vk::InternalAllocationType,
    scope: vk::SystemAllocationScope
) {
    (*(user_data as *const A)).internal_allocation_notification(size, kind, scope)
}

unsafe extern "system" fn internal_free<A: HostAllocator>(
    user_data: *mut c_void,
    size: usize,
    kind: vk::InternalAllocationType,
    scope: vk::SystemAllocationScope
) {
    (*(user_data as *const A)).internal_free_notification(size, kind, scope)
}


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeStatistics {
    pub allocations: u64,
    pub reallocations: u64,
    pub frees: u64,
    /// Bytes currently held in this scope.
    pub bytes: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocationStatistics {
    pub command: ScopeStatistics,
    pub object: ScopeStatistics,
    pub cache: ScopeStatistics,
    pub device: ScopeStatistics,
    pub instance: ScopeStatistics,
    pub internal_allocations: u64,
    pub internal_frees: u64,
    pub internal_bytes: usize,
    pub live_allocations: usize,
}

impl AllocationStatistics {
    fn scope_mut(&mut self, scope: vk::SystemAllocationScope) -> &mut ScopeStatistics {
        match scope {
            vk::SystemAllocationScope::COMMAND => &mut self.command,
            vk::SystemAllocationScope::CACHE => &mut self.cache,
            vk::SystemAllocationScope::DEVICE => &mut self.device,
            vk::SystemAllocationScope::INSTANCE => &mut self.instance,
            _ => &mut self.object
        }
    }
}

#[derive(Default)]
struct AllocationTable {
    blocks: HashMap<usize, (Layout, vk::SystemAllocationScope)>,
    statistics: AllocationStatistics,
}

/// Aligned host allocator that keeps a table of live blocks and per-scope counters.
///
/// Statistics readers take the shared lock; allocation and free take the exclusive one.
#[derive(Default)]
pub struct DebugAllocator {
    table: RwLock<AllocationTable>,
}

impl DebugAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statistics(&self) -> AllocationStatistics {
        self.table.read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .statistics
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AllocationTable> {
        self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostAllocator for DebugAllocator {
    fn alloc(&self, size: usize, alignment: usize, scope: vk::SystemAllocationScope) -> *mut c_void {
        let Ok(layout) = Layout::from_size_align(size, alignment.max(1)) else {
            return std::ptr::null_mut();
        };
        if layout.size() == 0 {
            return std::ptr::null_mut();
        }
        // SAFETY: layout has a nonzero size
        let Some(ptr) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
            return std::ptr::null_mut();
        };

        let mut table = self.write();
        table.blocks.insert(ptr.as_ptr() as usize, (layout, scope));
        table.statistics.live_allocations += 1;
        let statistics = table.statistics.scope_mut(scope);
        statistics.allocations += 1;
        statistics.bytes += size;

        ptr.as_ptr() as *mut c_void
    }

    fn realloc(&self, original: *mut c_void, size: usize, alignment: usize, scope: vk::SystemAllocationScope) -> *mut c_void {
        if original.is_null() {
            return self.alloc(size, alignment, scope);
        }
        if size == 0 {
            self.free(original);
            return std::ptr::null_mut();
        }
        let Ok(layout) = Layout::from_size_align(size, alignment.max(1)) else {
            return std::ptr::null_mut();
        };

        let mut table = self.write();
        let Some((old_layout, old_scope)) = table.blocks.remove(&(original as usize)) else {
            warn!("Reallocation of unknown host block {:p}", original);
            return std::ptr::null_mut();
        };
        // SAFETY: layout has a nonzero size
        let Some(ptr) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
            table.blocks.insert(original as usize, (old_layout, old_scope));
            return std::ptr::null_mut();
        };
        // SAFETY: both blocks are live and at least min(old, new) bytes long; the old block is
        // no longer in the table, so nothing else frees it
        unsafe {
            std::ptr::copy_nonoverlapping(original as *const u8, ptr.as_ptr(), old_layout.size().min(size));
            alloc::dealloc(original as *mut u8, old_layout);
        }

        table.blocks.insert(ptr.as_ptr() as usize, (layout, scope));
        table.statistics.scope_mut(old_scope).bytes -= old_layout.size();
        let statistics = table.statistics.scope_mut(scope);
        statistics.reallocations += 1;
        statistics.bytes += size;

        ptr.as_ptr() as *mut c_void
    }

    fn free(&self, memory: *mut c_void) {
        if memory.is_null() {
            return;
        }

        let mut table = self.write();
        let Some((layout, scope)) = table.blocks.remove(&(memory as usize)) else {
            warn!("Free of unknown host block {:p}", memory);
            return;
        };
        table.statistics.live_allocations -= 1;
        let statistics = table.statistics.scope_mut(scope);
        statistics.frees += 1;
        statistics.bytes -= layout.size();
        drop(table);

        // SAFETY: memory was allocated by `alloc` with this layout and is removed from the table
        unsafe { alloc::dealloc(memory as *mut u8, layout) };
    }

    fn internal_allocation_notification(&self, size: usize, kind: vk::InternalAllocationType, scope: vk::SystemAllocationScope) {
        debug!("Internal {:?} allocation of {} bytes in scope {:?}", kind, size, scope);
        let mut table = self.write();
        table.statistics.internal_allocations += 1;
        table.statistics.internal_bytes += size;
    }

    fn internal_free_notification(&self, size: usize, _kind: vk::InternalAllocationType, _scope: vk::SystemAllocationScope) {
        let mut table = self.write();
        table.statistics.internal_frees += 1;
        table.statistics.internal_bytes = table.statistics.internal_bytes.saturating_sub(size);
    }

    fn callbacks(&self) -> vk::AllocationCallbacks<'_> {
        host_callbacks(self)
    }
}

impl Drop for DebugAllocator {
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !table.blocks.is_empty() {
            warn!("Debug allocator dropped with {} live host allocations", table.blocks.len());
        }
        for (&address, &(layout, _)) in &table.blocks {
            // SAFETY: every table entry is a live block allocated with its layout
            unsafe { alloc::dealloc(address as *mut u8, layout) };
        }
        table.blocks.clear();
    }
}


/// Sub-allocation request passed to a [`DeviceAllocator`].
#[derive(Clone, Copy, Debug)]
pub struct AllocationRequest<'a> {
    pub name: &'a str,
    pub target: BindTarget,
    pub requirements: MemoryRequirements,
    pub flags: vk::MemoryPropertyFlags,
    pub priority: f32,
    /// Allocate a dedicated block for `target`.
    pub dedicated: bool,
    /// Linear resources, i.e. buffers and linear-tiled images.
    pub linear: bool,
}

/// Region of a pooled device memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubAllocation {
    pub id: u64,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub flags: vk::MemoryPropertyFlags,
}

/// Pooled device memory strategy owned by the device's user.
pub trait DeviceAllocator: Send + Sync {
    fn alloc(&self, request: &AllocationRequest<'_>) -> Result<SubAllocation>;
    fn free(&self, allocation: &SubAllocation) -> Result<()>;
    /// Persistently mapped host address of the sub-allocation, if host-visible.
    fn mapped_ptr(&self, allocation: &SubAllocation) -> Option<NonNull<c_void>>;
}

/// Host and device allocation strategies used when creating a resource.
#[derive(Clone, Default)]
pub struct Allocator {
    host: Option<Arc<dyn HostAllocator>>,
    device: Option<Arc<dyn DeviceAllocator>>,
}

impl Allocator {
    pub fn new(host: Option<Arc<dyn HostAllocator>>, device: Option<Arc<dyn DeviceAllocator>>) -> Self {
        Self { host, device }
    }

    pub fn with_host(host: Arc<dyn HostAllocator>) -> Self {
        Self { host: Some(host), device: None }
    }

    pub fn with_device(device: Arc<dyn DeviceAllocator>) -> Self {
        Self { host: None, device: Some(device) }
    }

    pub fn host_allocator(&self) -> Option<&Arc<dyn HostAllocator>> {
        self.host.as_ref()
    }

    pub fn device_allocator(&self) -> Option<&Arc<dyn DeviceAllocator>> {
        self.device.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_follow_each_scope() {
        let allocator = DebugAllocator::new();

        let object = allocator.alloc(64, 16, vk::SystemAllocationScope::OBJECT);
        let command = allocator.alloc(32, 8, vk::SystemAllocationScope::COMMAND);
        assert!(!object.is_null() && !command.is_null());
        assert_eq!(object as usize % 16, 0);

        let statistics = allocator.statistics();
        assert_eq!(statistics.object.allocations, 1);
        assert_eq!(statistics.object.bytes, 64);
        assert_eq!(statistics.command.bytes, 32);
        assert_eq!(statistics.live_allocations, 2);

        allocator.free(command);
        let statistics = allocator.statistics();
        assert_eq!(statistics.command.frees, 1);
        assert_eq!(statistics.command.bytes, 0);
        assert_eq!(statistics.live_allocations, 1);
        allocator.free(object);
        assert_eq!(allocator.statistics().live_allocations, 0);
    }

    #[test]
    fn reallocation_preserves_contents() {
        let allocator = DebugAllocator::new();
        let memory = allocator.alloc(4, 4, vk::SystemAllocationScope::OBJECT) as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), memory, 4) };

        let memory = allocator.realloc(memory as *mut c_void, 16, 4, vk::SystemAllocationScope::OBJECT) as *mut u8;
        let contents = unsafe { std::slice::from_raw_parts(memory, 4) };
        assert_eq!(contents, [1, 2, 3, 4]);

        let statistics = allocator.statistics();
        assert_eq!(statistics.object.reallocations, 1);
        assert_eq!(statistics.object.bytes, 16);
        assert_eq!(statistics.live_allocations, 1);
        allocator.free(memory as *mut c_void);
    }

    #[test]
    fn callbacks_dispatch_to_the_allocator() {
        let allocator = DebugAllocator::new();
        let callbacks = allocator.callbacks();
        assert_eq!(callbacks.p_user_data as *const DebugAllocator, Arc::as_ptr(&allocator));

        unsafe {
            let allocate = callbacks.pfn_allocation.unwrap();
            let free = callbacks.pfn_free.unwrap();
            let memory = allocate(callbacks.p_user_data, 128, 8, vk::SystemAllocationScope::DEVICE);
            assert_eq!(allocator.statistics().device.bytes, 128);
            free(callbacks.p_user_data, memory);
            assert_eq!(allocator.statistics().device.frees, 1);
        }
    }
}
