use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stackctx::{
    ContextError, Continuation, Fiber, FixedSizeStack, PooledFixedSizeStack, Preallocated,
    ProtectedFixedSizeStack, StackAllocator, StackBlock, StackTraits,
};

/// 每次分配都失败的分配器
struct ExhaustedStack;

impl StackAllocator for ExhaustedStack {
    fn allocate(&self) -> Result<StackBlock, ContextError> {
        Err(ContextError::AllocationFailure {
            size: 4096,
            source: io::ErrorKind::OutOfMemory.into(),
        })
    }

    fn deallocate(&self, _block: StackBlock) {
        unreachable!("nothing was allocated");
    }
}

fn depth(n: u32) -> u32 {
    let pad = [n as u8; 512];
    if n == 0 {
        return pad[0] as u32;
    }
    depth(n - 1) + pad[511] as u32 / 255
}

#[test]
fn test_fixed_size_stack_context() {
    let salloc = FixedSizeStack::new(128 * 1024).unwrap();
    let c = Continuation::with_stack(salloc, |c| c.with_data(depth(64))).unwrap();
    let mut c = c.resume();
    assert_eq!(c.get_data::<u32>(), 0);
}

#[test]
fn test_invalid_stack_size_rejected() {
    assert!(matches!(
        ProtectedFixedSizeStack::new(StackTraits::minimum_size() / 2),
        Err(ContextError::InvalidStackSize { .. })
    ));
    assert!(matches!(
        FixedSizeStack::new(0),
        Err(ContextError::InvalidStackSize { .. })
    ));
}

#[test]
fn test_pool_recycles_after_context_ends() {
    let pool = PooledFixedSizeStack::new(64 * 1024, 2).unwrap();
    for _ in 0..3 {
        let c = Continuation::with_stack(pool.clone(), |c| c).unwrap();
        assert!(c.resume().is_empty());
        assert_eq!(pool.cached(), 1);
    }
}

#[test]
fn test_pool_recycles_after_forced_unwind() {
    let pool = PooledFixedSizeStack::new(64 * 1024, 2).unwrap();
    let c = Continuation::with_stack(pool.clone(), |mut c| loop {
        c = c.resume();
    })
    .unwrap();
    let c = c.resume();
    assert_eq!(pool.cached(), 0);
    drop(c);
    assert_eq!(pool.cached(), 1);
}

#[test]
fn test_preallocated_region_survives() {
    let salloc = ProtectedFixedSizeStack::default();
    let block = salloc.allocate().unwrap();
    let palloc = Preallocated::new(block, 64).unwrap();
    let reserved = palloc.reserved();
    // SAFETY: 预留区域在上下文销毁之前归调用方使用
    unsafe { reserved.write_bytes(0xab, 64) };

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    let c = Continuation::with_preallocated(palloc, salloc, move |mut c| {
        flag.set(true);
        loop {
            c = c.resume();
        }
    })
    .unwrap();
    let c = c.resume();
    assert!(ran.get());
    // SAFETY: 同上
    let bytes = unsafe { std::slice::from_raw_parts(reserved, 64) };
    assert!(bytes.iter().all(|b| *b == 0xab));
    drop(c);
}

#[test]
fn test_allocation_failure_reaches_caller() {
    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    let result = Continuation::with_stack(ExhaustedStack, move |c| {
        flag.set(true);
        c
    });
    assert!(matches!(
        result,
        Err(ContextError::AllocationFailure { size: 4096, .. })
    ));
    assert!(!ran.get());
}

#[test]
fn test_fiber_allocation_failure_reaches_caller() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let result = Fiber::with_stack(ExhaustedStack, move |f| {
        flag.store(true, Ordering::SeqCst);
        f
    });
    match result {
        Err(ContextError::AllocationFailure { source, .. }) => {
            assert_eq!(source.kind(), io::ErrorKind::OutOfMemory);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!ran.load(Ordering::SeqCst));
}
