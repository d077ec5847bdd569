//! Allocator trees: buffers carved out of parent allocators and handed back
//! on teardown.

use std::{ptr::NonNull, rc::Rc};

use allocator::{
    AllocError, AllocatorKind, FreelistAllocator, LinearAllocator, PlacementPolicy,
    PoolAllocator, StackAllocator, SystemHeap, share,
};

fn fill_and_check(ptr: NonNull<u8>, len: usize, byte: u8) {
    unsafe { ptr.write_bytes(byte, len) };
    for i in 0..len {
        assert_eq!(unsafe { ptr.add(i).read() }, byte);
    }
}

#[test]
fn test_linear_child_consumes_one_pool_chunk() {
    let heap = SystemHeap::new();
    let pool = share(PoolAllocator::new(4, 256, 64, &heap).unwrap());
    let before = pool.borrow().free_item_count();

    let mut child = LinearAllocator::with_parent(200, Rc::clone(&pool)).unwrap();
    assert_eq!(child.parent_kind(), Some(AllocatorKind::Pool));
    assert_eq!(pool.borrow().free_item_count(), before - 1);

    let ptr = child.request_memory(200).unwrap();
    fill_and_check(ptr, 200, 0x3c);

    child.free_memory().unwrap();
    assert!(child.is_released());
    assert_eq!(pool.borrow().free_item_count(), before);
    assert_eq!(heap.active_allocations(), 1);
}

#[test]
fn test_child_larger_than_pool_chunk() {
    let heap = SystemHeap::new();
    let pool = share(PoolAllocator::new(2, 64, 8, &heap).unwrap());
    let err = StackAllocator::with_parent(128, Rc::clone(&pool)).unwrap_err();
    assert!(matches!(
        err,
        AllocError::ChunkTooSmall {
            requested: 128,
            chunk_size: 64,
            ..
        }
    ));
    assert_eq!(pool.borrow().free_item_count(), 2);
}

#[test]
fn test_misaligned_pool_child_gives_chunk_back() {
    let heap = SystemHeap::new();
    // 48-byte chunks: the second one starts 16 bytes past a 32-byte boundary
    let parent = share(PoolAllocator::new(2, 48, 16, &heap).unwrap());
    let first = parent.borrow_mut().request_memory().unwrap();

    let err = PoolAllocator::with_parent(1, 32, 32, Rc::clone(&parent)).unwrap_err();
    assert!(matches!(err, AllocError::MisalignedBuffer { align: 32, .. }));
    assert_eq!(parent.borrow().free_item_count(), 1);

    parent.borrow_mut().return_memory(first).unwrap();
}

#[test]
fn test_stack_parent_enforces_lifo_teardown() {
    let heap = SystemHeap::new();
    let stack = share(StackAllocator::new(1024, &heap).unwrap());

    let mut first = LinearAllocator::with_parent(128, Rc::clone(&stack)).unwrap();
    let mut second = StackAllocator::with_parent(128, Rc::clone(&stack)).unwrap();
    assert_eq!(stack.borrow().current_id(), 2);

    let err = first.free_memory().unwrap_err();
    assert!(matches!(
        err,
        AllocError::OrderViolation {
            expected: 2,
            found: 1,
            ..
        }
    ));
    assert!(!first.is_released());
    assert_eq!(first.parent_kind(), Some(AllocatorKind::Stack));
    first.request_memory(16).unwrap();

    second.free_memory().unwrap();
    first.free_memory().unwrap();
    assert_eq!(stack.borrow().offset(), 0);
    assert_eq!(stack.borrow().current_id(), 0);
}

#[test]
fn test_parent_refuses_teardown_with_children() {
    let heap = SystemHeap::new();
    let parent = share(LinearAllocator::new(1024, &heap).unwrap());
    let mut child = StackAllocator::with_parent(256, Rc::clone(&parent)).unwrap();

    assert!(matches!(
        parent.borrow_mut().free_memory(),
        Err(AllocError::ChildrenOutstanding { count: 1, .. })
    ));
    assert!(matches!(
        parent.borrow_mut().reset_allocator(),
        Err(AllocError::ChildrenOutstanding { .. })
    ));
    assert!(!parent.borrow().is_released());

    child.free_memory().unwrap();
    // a linear parent keeps the space consumed until it is reset
    assert_eq!(parent.borrow().offset(), 256);
    parent.borrow_mut().reset_allocator().unwrap();
    assert_eq!(parent.borrow().offset(), 0);
    parent.borrow_mut().free_memory().unwrap();
    assert_eq!(heap.active_allocations(), 0);
}

#[test]
fn test_busy_parent() {
    let heap = SystemHeap::new();
    let parent = share(FreelistAllocator::new(512, PlacementPolicy::FindFirst, &heap).unwrap());
    let guard = parent.borrow_mut();
    let err = LinearAllocator::with_parent(64, Rc::clone(&parent)).unwrap_err();
    assert!(matches!(
        err,
        AllocError::ParentBusy {
            kind: AllocatorKind::GeneralFreelist,
            ..
        }
    ));
    drop(guard);
    assert_eq!(parent.borrow().used(), 0);
}

#[test]
fn test_freelist_parent_hosts_every_kind() {
    let heap = SystemHeap::new();
    let parent = share(FreelistAllocator::new(4096, PlacementPolicy::FindBest, &heap).unwrap());

    let mut linear = LinearAllocator::with_parent(256, Rc::clone(&parent)).unwrap();
    let mut stack = StackAllocator::with_parent(256, Rc::clone(&parent)).unwrap();
    let mut pool = PoolAllocator::with_parent(4, 32, 8, Rc::clone(&parent)).unwrap();
    let mut freelist =
        FreelistAllocator::with_parent(512, PlacementPolicy::FindFirst, Rc::clone(&parent))
            .unwrap();
    for kind in [
        linear.parent_kind(),
        stack.parent_kind(),
        pool.parent_kind(),
        freelist.parent_kind(),
    ] {
        assert_eq!(kind, Some(AllocatorKind::GeneralFreelist));
    }
    assert!(parent.borrow().used() >= 256 + 256 + 128 + 512);

    fill_and_check(linear.request_memory(100).unwrap(), 100, 1);
    fill_and_check(stack.request_aligned_memory(64, 32).unwrap(), 64, 2);
    fill_and_check(pool.request_memory().unwrap(), 32, 3);
    fill_and_check(freelist.request_memory(300).unwrap(), 300, 4);

    // children are independent of each other, so any order works
    stack.free_memory().unwrap();
    freelist.free_memory().unwrap();
    linear.free_memory().unwrap();
    pool.free_memory().unwrap();

    let parent = parent.borrow();
    assert_eq!(parent.used(), 0);
    assert_eq!(parent.free_blocks().collect::<Vec<_>>(), vec![0..4096]);
    assert_eq!(heap.active_allocations(), 1);
}

#[test]
fn test_deep_tree_releases_to_heap() {
    let heap = SystemHeap::new();
    {
        let stack = share(StackAllocator::new(4096, &heap).unwrap());
        let freelist = share(
            FreelistAllocator::with_parent(1024, PlacementPolicy::FindFirst, Rc::clone(&stack))
                .unwrap(),
        );
        let pool = share(PoolAllocator::with_parent(8, 16, 16, Rc::clone(&freelist)).unwrap());
        let mut leaf = LinearAllocator::with_parent(16, Rc::clone(&pool)).unwrap();

        assert_eq!(pool.borrow().parent_kind(), Some(AllocatorKind::GeneralFreelist));
        assert_eq!(freelist.borrow().parent_kind(), Some(AllocatorKind::Stack));
        assert_eq!(stack.borrow().parent_kind(), Some(AllocatorKind::Default));
        assert_eq!(pool.borrow().free_item_count(), 7);

        let ptr = leaf.request_aligned_memory(16, 16).unwrap();
        assert_eq!(ptr.addr().get() % 16, 0);
        assert_eq!(heap.active_allocations(), 1);
        assert_eq!(heap.bytes_outstanding(), 4096);
    }
    assert_eq!(heap.active_allocations(), 0);
    assert_eq!(heap.bytes_outstanding(), 0);
}

#[test]
fn test_child_keeps_parent_alive() {
    let heap = SystemHeap::new();
    let parent = share(StackAllocator::new(512, &heap).unwrap());
    let child = PoolAllocator::with_parent(4, 16, 8, Rc::clone(&parent)).unwrap();

    drop(parent);
    assert_eq!(heap.active_allocations(), 1);
    assert_eq!(child.free_item_count(), 4);

    drop(child);
    assert_eq!(heap.active_allocations(), 0);
}

#[test]
fn test_external_parent_is_left_alone() {
    let heap = SystemHeap::new();
    let mut storage = vec![0u64; 64];
    let ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
    let parent =
        share(unsafe { FreelistAllocator::from_external(ptr, 512, PlacementPolicy::FindFirst) });

    let mut child = StackAllocator::with_parent(128, Rc::clone(&parent)).unwrap();
    child.request_memory(32).unwrap();
    child.free_memory().unwrap();

    parent.borrow_mut().free_memory().unwrap();
    assert_eq!(parent.borrow().parent_kind(), None);
    assert_eq!(heap.active_allocations(), 0);
}
