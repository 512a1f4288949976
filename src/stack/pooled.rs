//! 回收式栈分配器
//!
//! # Overview
//! 频繁创建与销毁上下文时，每次 `mmap` / `munmap` 的开销不可忽视。
//! 本分配器把归还的栈块缓存起来，下次分配时优先复用。
//!
//! # Design
//! - 使用共享的回收池：先复用回收的块，否则向底层 `ProtectedFixedSizeStack` 申请新的。
//! - 回收池容量有上限，超出时直接归还给底层分配器。
//! - 克隆得到的分配器共享同一个池，可以跨线程使用。
//!
//! # Invariants
//! - 池中的块大小一致，且都来自同一个底层分配器。
//! - 同一块不会被重复放入池中。

use std::sync::Arc;

use super::{ProtectedFixedSizeStack, StackAllocator, StackBlock};
use crate::config::POOL_CAPACITY;
use crate::error::ContextError;
use crate::sync::ExclusiveCell;

#[derive(Clone)]
pub struct PooledFixedSizeStack {
    pool: Arc<StackPool>,
}

struct StackPool {
    backing: ProtectedFixedSizeStack,
    capacity: usize,
    /// 回收的块，可以重新分配
    recycled: ExclusiveCell<Vec<StackBlock>>,
}

impl PooledFixedSizeStack {
    /// 创建每块可用空间为 `size` 字节、最多缓存 `capacity` 块的回收池
    pub fn new(size: usize, capacity: usize) -> Result<Self, ContextError> {
        Ok(Self::with_backing(ProtectedFixedSizeStack::new(size)?, capacity))
    }

    fn with_backing(backing: ProtectedFixedSizeStack, capacity: usize) -> Self {
        Self {
            pool: Arc::new(StackPool {
                backing,
                capacity,
                recycled: ExclusiveCell::new(Vec::new()),
            }),
        }
    }

    /// 当前缓存的块数
    pub fn cached(&self) -> usize {
        self.pool.recycled.exclusive_access().len()
    }

    pub fn size(&self) -> usize {
        self.pool.backing.size()
    }
}

impl Default for PooledFixedSizeStack {
    fn default() -> Self {
        Self::with_backing(ProtectedFixedSizeStack::default(), POOL_CAPACITY)
    }
}

impl std::fmt::Debug for PooledFixedSizeStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFixedSizeStack")
            .field("size", &self.size())
            .field("capacity", &self.pool.capacity)
            .field("cached", &self.cached())
            .finish()
    }
}

impl StackAllocator for PooledFixedSizeStack {
    fn allocate(&self) -> Result<StackBlock, ContextError> {
        if let Some(block) = self.pool.recycled.exclusive_access().pop() {
            log::debug!("[stack_pool] reuse block at {:#x}", block.top);
            return Ok(block);
        }
        self.pool.backing.allocate()
    }

    fn deallocate(&self, block: StackBlock) {
        let overflow = self.pool.recycled.exclusive_session(|recycled| {
            debug_assert!(
                !recycled.iter().any(|b| b.top == block.top),
                "block {:#x} has been deallocated!",
                block.top
            );
            if recycled.len() < self.pool.capacity {
                recycled.push(block);
                None
            } else {
                Some(block)
            }
        });
        if let Some(block) = overflow {
            self.pool.backing.deallocate(block);
        }
    }
}

impl Drop for StackPool {
    /// 回收池销毁时，把缓存的块全部归还
    fn drop(&mut self) {
        let recycled = std::mem::take(&mut *self.recycled.exclusive_access());
        for block in recycled {
            self.backing.deallocate(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_blocks() {
        let salloc = PooledFixedSizeStack::default();
        let block = salloc.allocate().unwrap();
        let top = block.top();
        salloc.deallocate(block);
        assert_eq!(salloc.cached(), 1);

        let again = salloc.allocate().unwrap();
        assert_eq!(again.top(), top);
        assert_eq!(salloc.cached(), 0);
        salloc.deallocate(again);
    }

    #[test]
    fn test_pool_capacity_bound() {
        let salloc = PooledFixedSizeStack::new(crate::StackTraits::minimum_size(), 1).unwrap();
        let a = salloc.allocate().unwrap();
        let b = salloc.allocate().unwrap();
        salloc.deallocate(a);
        salloc.deallocate(b);
        assert_eq!(salloc.cached(), 1);
    }

    #[test]
    fn test_clones_share_pool() {
        let salloc = PooledFixedSizeStack::default();
        let other = salloc.clone();
        let block = salloc.allocate().unwrap();
        other.deallocate(block);
        assert_eq!(salloc.cached(), 1);
    }
}
