//! Call-scoped extension chains for memory allocation.
//!
//! A [`StructureChain`] collects tagged extension records while a resource decides how its
//! memory should be allocated. Just before the native call the records are materialized into
//! the matching Vulkan structures and threaded through `pNext`. The chain is never kept
//! beyond the call that consumes it.

use ash::vk;


const FNV_PRIME: u64 = 1099511628211;
const FNV_BASIS: u64 = 14695981039346656037;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExtensionNode {
    /// `VkMemoryDedicatedAllocateInfo`
    DedicatedAllocation {
        buffer: vk::Buffer,
        image: vk::Image
    },
    /// `VkMemoryAllocateFlagsInfo`
    AllocateFlags {
        flags: vk::MemoryAllocateFlags,
        device_mask: u32
    },
    /// `VkMemoryPriorityAllocateInfoEXT`, passed through unvalidated.
    Priority(f32),
}

impl ExtensionNode {
    pub fn structure_type(&self) -> vk::StructureType {
        match self {
            Self::DedicatedAllocation { .. } => vk::StructureType::MEMORY_DEDICATED_ALLOCATE_INFO,
            Self::AllocateFlags { .. } => vk::StructureType::MEMORY_ALLOCATE_FLAGS_INFO,
            Self::Priority(_) => vk::StructureType::MEMORY_PRIORITY_ALLOCATE_INFO_EXT,
        }
    }

    fn hash(&self) -> u64 {
        let seed = fnv1a(self.structure_type().as_raw() as u64);
        match *self {
            Self::DedicatedAllocation { buffer, image } => {
                let seed = hash_combine(seed, fnv1a(vk::Handle::as_raw(buffer)));
                hash_combine(seed, fnv1a(vk::Handle::as_raw(image)))
            },
            Self::AllocateFlags { flags, device_mask } => {
                let seed = hash_combine(seed, fnv1a(flags.as_raw() as u64));
                hash_combine(seed, fnv1a(device_mask as u64))
            },
            Self::Priority(priority) => hash_combine(seed, fnv1a(priority.to_bits() as u64)),
        }
    }
}

/// Append-only list of extension records. The most recently linked node is the head, i.e. the
/// structure the driver sees first through `pNext`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructureChain {
    // Link order; the head is the last element.
    nodes: Vec<ExtensionNode>,
}

impl StructureChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `node` in front of the nodes linked so far.
    pub fn link_node(&mut self, node: ExtensionNode) {
        self.nodes.push(node);
    }

    pub fn head_node(&self) -> Option<&ExtensionNode> {
        self.nodes.last()
    }

    /// Walks the chain from its head, in the order the driver traverses `pNext`.
    pub fn chain_nodes(&self) -> impl Iterator<Item = &ExtensionNode> + '_ {
        self.nodes.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn hash(&self) -> u64 {
        self.chain_nodes()
            .fold(FNV_BASIS, |seed, node| hash_combine(seed, node.hash()))
    }

    pub fn dedicated(&self) -> Option<(vk::Buffer, vk::Image)> {
        self.chain_nodes().find_map(|node| match *node {
            ExtensionNode::DedicatedAllocation { buffer, image } => Some((buffer, image)),
            _ => None
        })
    }

    pub fn allocate_flags(&self) -> Option<(vk::MemoryAllocateFlags, u32)> {
        self.chain_nodes().find_map(|node| match *node {
            ExtensionNode::AllocateFlags { flags, device_mask } => Some((flags, device_mask)),
            _ => None
        })
    }

    pub fn priority(&self) -> Option<f32> {
        self.chain_nodes().find_map(|node| match *node {
            ExtensionNode::Priority(priority) => Some(priority),
            _ => None
        })
    }

    /// Materializes the native structures in link order, ready for [`thread_allocate_info`].
    pub(crate) fn native_nodes(&self) -> Vec<NativeNode> {
        self.nodes.iter()
            .map(|node| match *node {
                ExtensionNode::DedicatedAllocation { buffer, image } => NativeNode::Dedicated(
                    vk::MemoryDedicatedAllocateInfo::default()
                        .buffer(buffer)
                        .image(image)
                ),
                ExtensionNode::AllocateFlags { flags, device_mask } => NativeNode::Flags(
                    vk::MemoryAllocateFlagsInfo::default()
                        .flags(flags)
                        .device_mask(device_mask)
                ),
                ExtensionNode::Priority(priority) => NativeNode::Priority(
                    vk::MemoryPriorityAllocateInfoEXT::default()
                        .priority(priority)
                ),
            })
            .collect()
    }
}

pub(crate) enum NativeNode {
    Dedicated(vk::MemoryDedicatedAllocateInfo<'static>),
    Flags(vk::MemoryAllocateFlagsInfo<'static>),
    Priority(vk::MemoryPriorityAllocateInfoEXT<'static>),
}

/// Threads `nodes` through `info`. `push_next` prepends, so the last node becomes the head.
pub(crate) fn thread_allocate_info<'a>(
    mut info: vk::MemoryAllocateInfo<'a>,
    nodes: &'a mut [NativeNode]
) -> vk::MemoryAllocateInfo<'a> {
    for node in nodes.iter_mut() {
        info = match node {
            NativeNode::Dedicated(next) => info.push_next(next),
            NativeNode::Flags(next) => info.push_next(next),
            NativeNode::Priority(next) => info.push_next(next),
        };
    }

    info
}

fn fnv1a(value: u64) -> u64 {
    value.to_le_bytes()
        .iter()
        .fold(FNV_BASIS, |hash, byte| (hash ^ *byte as u64).wrapping_mul(FNV_PRIME))
}

fn hash_combine(seed: u64, hash: u64) -> u64 {
    seed ^ hash.wrapping_add(0x9e3779b9)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}
