use std::sync::{Arc, Weak};

use cinder_platform::{PAGE_SHIFT, PAGE_SIZE};

use crate::address_space::{get_shared_gpu_mapping, AddressSpace};
use crate::buffer::Buffer;
use crate::context::Context;
use crate::mapping::GpuMapping;
use crate::{GpuAddr, Status};

/// Pointer patch: the 64-bit slot at `offset` inside the owning resource
/// receives the GPU address of `target_offset` inside the target resource.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub offset: u64,
    pub target_resource_index: usize,
    pub target_offset: u64,
}

pub struct ExecResource {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub length: u64,
    pub relocations: Vec<Relocation>,
}

struct Prepared {
    // Held strong for the lifetime of the command buffer so the context
    // cannot die while the hardware references its ring.
    context: Arc<Context>,
    mappings: Vec<Arc<GpuMapping>>,
    batch_gpu_addr: GpuAddr,
}

/// One client submission: resource list, relocation tables, and which
/// resource is the batch. Holds only a weak context reference until
/// `prepare_for_execution` locks it.
pub struct CommandBuffer {
    context: Weak<Context>,
    resources: Vec<ExecResource>,
    batch_index: usize,
    sequence_number: Option<u32>,
    prepared: Option<Prepared>,
}

impl CommandBuffer {
    pub fn new(context: Weak<Context>, resources: Vec<ExecResource>, batch_index: usize) -> Self {
        assert!(batch_index < resources.len());
        Self {
            context,
            resources,
            batch_index,
            sequence_number: None,
            prepared: None,
        }
    }

    pub fn context(&self) -> Option<Arc<Context>> {
        self.prepared
            .as_ref()
            .map(|p| Arc::clone(&p.context))
            .or_else(|| self.context.upgrade())
    }

    pub fn resources(&self) -> &[ExecResource] {
        &self.resources
    }

    /// GPU address of the batch start; available once prepared.
    pub fn batch_gpu_addr(&self) -> Option<GpuAddr> {
        self.prepared.as_ref().map(|p| p.batch_gpu_addr)
    }

    pub fn sequence_number(&self) -> Option<u32> {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, seqno: u32) {
        self.sequence_number = Some(seqno);
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    /// Maps every resource into `address_space` and patches every
    /// relocation. All-or-nothing: a mapping failure unwinds the mappings
    /// made so far, and no resource byte is written until the entire
    /// relocation table has validated.
    pub fn prepare_for_execution(
        &mut self,
        address_space: &Arc<dyn AddressSpace>,
    ) -> Result<(), Status> {
        assert!(self.prepared.is_none(), "command buffer already prepared");
        let context = self.context.upgrade().ok_or(Status::ContextKilled)?;

        let mut mappings: Vec<Arc<GpuMapping>> = Vec::with_capacity(self.resources.len());
        for resource in &self.resources {
            let map_offset = resource.offset & !(PAGE_SIZE - 1);
            let map_length = resource.offset + resource.length - map_offset;
            match get_shared_gpu_mapping(
                address_space,
                &resource.buffer,
                map_offset,
                map_length,
                PAGE_SHIFT,
            ) {
                Ok(mapping) => mappings.push(mapping),
                Err(err) => {
                    // Unwind; mappings created for earlier resources drop here.
                    drop(mappings);
                    return Err(err);
                }
            }
        }

        for resource in &self.resources {
            for reloc in &resource.relocations {
                if reloc.target_resource_index >= self.resources.len() {
                    return Err(Status::InvalidArgs);
                }
                let end = reloc.offset.checked_add(8).ok_or(Status::InvalidArgs)?;
                if end > resource.length {
                    return Err(Status::InvalidArgs);
                }
                let target = &self.resources[reloc.target_resource_index];
                if reloc.target_offset >= target.length {
                    return Err(Status::InvalidArgs);
                }
            }
        }

        for resource in &self.resources {
            for reloc in &resource.relocations {
                let target = &self.resources[reloc.target_resource_index];
                let target_mapping = &mappings[reloc.target_resource_index];
                let target_addr = target_mapping.gpu_addr()
                    + (target.offset - target_mapping.offset())
                    + reloc.target_offset;
                resource
                    .buffer
                    .platform()
                    .write_u64(resource.offset + reloc.offset, target_addr)?;
            }
        }

        let batch = &self.resources[self.batch_index];
        let batch_mapping = &mappings[self.batch_index];
        let batch_gpu_addr = batch_mapping.gpu_addr() + (batch.offset - batch_mapping.offset());

        self.prepared = Some(Prepared {
            context,
            mappings,
            batch_gpu_addr,
        });
        Ok(())
    }

    /// Mappings held for the hardware; empty before preparation.
    pub fn mappings(&self) -> &[Arc<GpuMapping>] {
        self.prepared.as_ref().map(|p| p.mappings.as_slice()).unwrap_or(&[])
    }
}
