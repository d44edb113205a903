//! Ownership-safe Vulkan resources with explicit memory binding and staged transfers.
//!
//! Everything lives in [`gpu`]; see [`gpu::prelude`] for the common types.

pub use bindery_gpu as gpu;
