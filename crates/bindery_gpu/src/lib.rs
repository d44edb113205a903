pub mod allocator;
pub mod chain;
pub mod command;
pub mod context;
pub mod device;
pub mod driver;
pub mod error;
pub mod extensions;
pub mod handle;
pub mod memory;
pub mod pool;
pub mod resource;
pub mod sync;
pub mod transfer;
pub mod validation;

pub use error::{Error, Result};

// Reexport
pub use ash::{self, vk};


pub mod prelude {
    pub use crate::allocator::{
        Allocator,
        DebugAllocator,
        HostAllocator,
        managed::GpuAllocator
    };
    pub use crate::command::{
        CommandBuffer,
        CommandBufferState,
        CommandPool,
        Queue
    };
    pub use crate::context::{
        Context,
        ContextInfo
    };
    pub use crate::device::{
        Device,
        DeviceInfo
    };
    pub use crate::driver::emulated::EmulatedDevice;
    pub use crate::memory::{
        priority,
        DeviceMemory,
        Memory
    };
    pub use crate::resource::{
        AccelerationStructure,
        AccelerationStructureInfo,
        Buffer,
        BufferInfo,
        Image,
        ImageInfo,
        Initializer,
        Resource,
        Sharing,
        buffer::InitialData
    };
    pub use crate::sync::{
        Fence,
        Semaphore
    };
    pub use crate::transfer::{
        CopyRegion,
        WHOLE_SIZE
    };
    pub use crate::{vk, Error, Result};
}
