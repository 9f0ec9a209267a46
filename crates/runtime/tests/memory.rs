//! End-to-end scenarios for linear memory creation, growth, compartment
//! binding, and fault attribution.

use ferrite_environ::{MemoryType, Pages, WASM_PAGE_SIZE};
use ferrite_runtime::{host_page_size, is_address_owned_by_memory, Compartment};

fn ty(minimum: u64, maximum: u64) -> MemoryType {
    MemoryType::new(Pages(minimum), Pages(maximum))
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn create_publishes_a_live_memory() {
    init_logging();
    let compartment = Compartment::new();
    let memory = compartment.create_memory(&ty(1, 10)).unwrap();

    assert_eq!(memory.num_pages(), Pages(1));
    assert!(!memory.base().is_null());

    // The id resolves through the compartment, and the base array generated
    // code would read agrees with the handle.
    let id = memory.id();
    assert_eq!(compartment.runtime_data().memory_base(id), memory.base());
    assert_eq!(compartment.memory(id).unwrap().base(), memory.base());

    // The committed first page is writable through the published base.
    unsafe {
        memory.base().write(1);
        assert_eq!(memory.base().read(), 1);
    }
}

#[test]
fn grow_extends_the_committed_prefix_in_place() {
    init_logging();
    let compartment = Compartment::new();
    let memory = compartment.create_memory(&ty(1, 10)).unwrap();
    let base = memory.base();

    assert_eq!(memory.grow(Pages(3)).unwrap(), Pages(1));
    assert_eq!(memory.num_pages(), Pages(4));
    assert_eq!(memory.base(), base);

    // Bytes just past the old boundary are now writable.
    unsafe {
        base.add(WASM_PAGE_SIZE).write(2);
        base.add(WASM_PAGE_SIZE + 1).write(3);
        assert_eq!(base.add(WASM_PAGE_SIZE).read(), 2);
        assert_eq!(base.add(WASM_PAGE_SIZE + 1).read(), 3);
    }

    // Growing past the maximum fails and leaves the memory unchanged.
    assert!(memory.grow(Pages(7)).is_err());
    assert_eq!(memory.num_pages(), Pages(4));
    assert_eq!(memory.base(), base);

    // Shrinking hands back the previous size and keeps the base stable.
    assert_eq!(memory.shrink(Pages(2)).unwrap(), Pages(4));
    assert_eq!(memory.num_pages(), Pages(2));
    assert_eq!(memory.base(), base);
}

#[test]
fn validation_stops_at_the_reservation_end() {
    init_logging();
    let compartment = Compartment::new();
    let memory = compartment.create_memory(&ty(1, 10)).unwrap();
    let end = memory.end_offset();

    assert!(memory.validated_range(end - 4, 4).is_ok());
    assert!(memory.validated_range(end - 4, 8).is_err());

    // Shorter lengths at the same offset keep succeeding.
    assert!(memory.validated_range(end - 4, 2).is_ok());
    assert!(memory.validated_range(end - 4, 0).is_ok());
}

#[test]
fn clone_binds_the_same_id_in_the_new_compartment() {
    init_logging();
    let c1 = Compartment::new();
    let _m0 = c1.create_memory(&ty(1, 5)).unwrap();
    let _m1 = c1.create_memory(&ty(1, 5)).unwrap();
    let source = c1.create_memory(&ty(1, 10)).unwrap();
    source.grow(Pages(2)).unwrap();
    let id = source.id();
    assert_eq!(id.index(), 2);

    let c2 = Compartment::new();
    let clone = c2.clone_memory(&source).unwrap();

    assert_eq!(clone.id(), id);
    assert_eq!(clone.num_pages(), source.num_pages());
    assert_eq!(clone.ty(), source.ty());
    assert_ne!(clone.base(), source.base());
    assert_eq!(c2.runtime_data().memory_base(id), clone.base());
}

#[test]
#[should_panic(expected = "already occupied")]
fn cloning_twice_into_one_compartment_panics() {
    init_logging();
    let c1 = Compartment::new();
    let source = c1.create_memory(&ty(1, 10)).unwrap();

    let c2 = Compartment::new();
    let _clone = c2.clone_memory(&source).unwrap();
    let _ = c2.clone_memory(&source);
}

#[test]
fn attribution_tracks_the_memory_lifecycle() {
    init_logging();
    let compartment = Compartment::new();
    let memory = compartment.create_memory(&ty(1, 10)).unwrap();
    let base = memory.base();
    let end_offset = memory.end_offset();
    let id = memory.id();

    // Everything in [base, base + end_offset) is attributed to the memory,
    // including committed and uncommitted territory; the guard page and the
    // byte before the reservation are not. Probe addresses are computed as
    // integers since some of them point outside the mapping.
    let addr = |offset: usize| (base as usize + offset) as *const u8;
    assert!(is_address_owned_by_memory(addr(0)));
    assert!(is_address_owned_by_memory(addr(WASM_PAGE_SIZE)));
    assert!(is_address_owned_by_memory(addr(end_offset - 1)));
    assert!(!is_address_owned_by_memory(addr(end_offset)));
    assert!(!is_address_owned_by_memory((base as usize - 1) as *const u8));

    compartment.destroy_memory(id);
    assert!(compartment.memory(id).is_none());
    assert!(compartment.runtime_data().memory_base(id).is_null());

    // The handle still pins the reservation.
    assert!(is_address_owned_by_memory(addr(0)));

    drop(memory);
    assert!(!is_address_owned_by_memory(addr(0)));
    assert!(!is_address_owned_by_memory(addr(end_offset - 1)));
}

#[test]
fn destroyed_ids_are_reused_lowest_first() {
    init_logging();
    let compartment = Compartment::new();
    let m0 = compartment.create_memory(&ty(1, 5)).unwrap();
    let m1 = compartment.create_memory(&ty(1, 5)).unwrap();
    let id0 = m0.id();
    assert_eq!(id0.index(), 0);
    assert_eq!(m1.id().index(), 1);

    compartment.destroy_memory(id0);
    drop(m0);

    let m2 = compartment.create_memory(&ty(1, 5)).unwrap();
    assert_eq!(m2.id(), id0);
    assert_eq!(compartment.runtime_data().memory_base(id0), m2.base());
}

#[test]
fn reservations_do_not_overlap() {
    init_logging();
    let compartment = Compartment::new();
    let a = compartment.create_memory(&ty(1, 10)).unwrap();
    let b = compartment.create_memory(&ty(1, 10)).unwrap();

    let guard = ferrite_runtime::NUM_GUARD_PAGES * host_page_size();
    let a_range = a.base() as usize..a.base() as usize + a.end_offset() + guard;
    let b_range = b.base() as usize..b.base() as usize + b.end_offset() + guard;
    assert!(a_range.end <= b_range.start || b_range.end <= a_range.start);
}
