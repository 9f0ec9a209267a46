//! Compartments: isolation domains that own linear memories and publish
//! their base addresses for generated code.

use crate::index_allocator::{SlotId, SlotTable};
use crate::memory::{LinearMemory, MemoryError};
use ferrite_environ::MemoryType;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

/// The number of memories one compartment can bind at once.
///
/// Generated code indexes the published base array with a compartment-local
/// id, so the array's capacity is baked into the code's addressing and must
/// be a fixed constant.
pub const MAX_MEMORIES_PER_COMPARTMENT: usize = 256;

/// The per-compartment data generated code reads directly: a dense array of
/// memory base addresses indexed by slot id.
///
/// Reads are unsynchronized relaxed loads. That is sound because a base is
/// published under the compartment mutex before its id escapes to any
/// module, and unpublished only after all code referencing the id has
/// quiesced.
#[derive(Debug)]
pub struct CompartmentRuntimeData {
    memory_bases: Box<[AtomicPtr<u8>]>,
}

impl CompartmentRuntimeData {
    fn new() -> Self {
        let memory_bases = (0..MAX_MEMORIES_PER_COMPARTMENT)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self { memory_bases }
    }

    /// The published base address for `id`; null while the slot is vacant.
    pub fn memory_base(&self, id: SlotId) -> *mut u8 {
        self.memory_bases[id.index()].load(Ordering::Relaxed)
    }

    /// The raw base array, for baking its address into generated code.
    pub fn memory_bases_ptr(&self) -> *const AtomicPtr<u8> {
        self.memory_bases.as_ptr()
    }

    fn publish(&self, id: SlotId, base: *mut u8) {
        self.memory_bases[id.index()].store(base, Ordering::Release);
    }
}

/// An isolation domain owning a coherent set of linear memories.
///
/// The compartment holds the strong references; each memory carries only a
/// weak back-reference. Binding and unbinding happen under the compartment
/// mutex, and the base array is updated before an id becomes visible and
/// after it stops being used.
#[derive(Debug)]
pub struct Compartment {
    memories: Mutex<SlotTable<Arc<LinearMemory>>>,
    runtime_data: CompartmentRuntimeData,
}

impl Compartment {
    /// Create an empty compartment.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            memories: Mutex::new(SlotTable::new()),
            runtime_data: CompartmentRuntimeData::new(),
        })
    }

    /// The data generated code reads directly.
    pub fn runtime_data(&self) -> &CompartmentRuntimeData {
        &self.runtime_data
    }

    /// Create a memory of `ty` in this compartment: an 8 GiB reservation
    /// with the type's minimum committed, bound under the lowest free id.
    ///
    /// Every failure path releases whatever was acquired; a failed create
    /// leaks neither address space nor an id.
    pub fn create_memory(self: &Arc<Self>, ty: &MemoryType) -> Result<Arc<LinearMemory>, MemoryError> {
        let memory = Arc::new(LinearMemory::with_reservation(
            ty,
            Arc::downgrade(self),
            ty.minimum,
        )?);

        let mut memories = self.memories.lock().unwrap();
        let max_id = (MAX_MEMORIES_PER_COMPARTMENT - 1) as u32;
        let id = memories
            .add(max_id, memory.clone())
            .ok_or(MemoryError::IdsExhausted)?;
        memory.bind_id(id);
        self.runtime_data.publish(id, memory.base());

        Ok(memory)
    }

    /// Create a memory in this compartment mirroring `source`: same type,
    /// same committed page count, and bound at the id `source` has in its
    /// own compartment, so code compiled against that id resolves to the
    /// clone here.
    ///
    /// Contents are not copied at this layer. Panics if the id is already
    /// bound in this compartment.
    pub fn clone_memory(
        self: &Arc<Self>,
        source: &LinearMemory,
    ) -> Result<Arc<LinearMemory>, MemoryError> {
        let id = source.id();
        let memory = Arc::new(LinearMemory::with_reservation(
            source.ty(),
            Arc::downgrade(self),
            source.num_pages(),
        )?);

        let mut memories = self.memories.lock().unwrap();
        memories.insert_at(id, memory.clone());
        memory.bind_id(id);
        self.runtime_data.publish(id, memory.base());

        Ok(memory)
    }

    /// Look up a live memory by id.
    pub fn memory(&self, id: SlotId) -> Option<Arc<LinearMemory>> {
        self.memories.lock().unwrap().get(id).cloned()
    }

    /// Unbind the memory at `id`: unpublish its base and drop this
    /// compartment's owning reference. The reservation is decommitted,
    /// deregistered, and released once the last outstanding handle drops.
    ///
    /// Panics if `id` is vacant.
    pub fn destroy_memory(&self, id: SlotId) {
        let memory = {
            let mut memories = self.memories.lock().unwrap();
            let memory = memories.remove(id);
            debug_assert_eq!(self.runtime_data.memory_base(id), memory.base());
            self.runtime_data.publish(id, ptr::null_mut());
            memory
        };
        drop(memory);
    }
}

impl Drop for Compartment {
    fn drop(&mut self) {
        // Unpublish every remaining base before the owning references go
        // away with the slot table.
        let memories = match self.memories.get_mut() {
            Ok(memories) => memories,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (id, _memory) in memories.iter() {
            self.runtime_data.publish(id, ptr::null_mut());
        }
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<Compartment>();
}
