//! 堆上分配的栈，没有保护页
//!
//! 适合栈用量可预期、又希望避免 `mmap` 系统调用开销的场景。

use std::alloc::{self, Layout};
use std::io;

use super::{check_size, StackAllocator, StackBlock};
use crate::config::{StackTraits, STACK_ALIGN};
use crate::error::ContextError;

#[derive(Debug, Clone, Copy)]
pub struct FixedSizeStack {
    size: usize,
}

impl FixedSizeStack {
    pub fn new(size: usize) -> Result<Self, ContextError> {
        check_size(size)?;
        Ok(Self {
            size: (size + STACK_ALIGN - 1) & !(STACK_ALIGN - 1),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn layout(size: usize) -> Layout {
        // size 非零且已按 16 字节对齐，构造不会失败
        Layout::from_size_align(size, STACK_ALIGN).unwrap_or_else(|_| unreachable!())
    }
}

impl Default for FixedSizeStack {
    fn default() -> Self {
        Self {
            size: StackTraits::default_size(),
        }
    }
}

impl StackAllocator for FixedSizeStack {
    fn allocate(&self) -> Result<StackBlock, ContextError> {
        // SAFETY: layout 大小非零
        let base = unsafe { alloc::alloc(Self::layout(self.size)) };
        if base.is_null() {
            return Err(ContextError::AllocationFailure {
                size: self.size,
                source: io::ErrorKind::OutOfMemory.into(),
            });
        }
        // SAFETY: 整块内存由本分配器独占且可读写
        Ok(unsafe { StackBlock::from_raw_parts(base.add(self.size), self.size, 0) })
    }

    fn deallocate(&self, block: StackBlock) {
        // SAFETY: 块来自本分配器的 allocate，布局一致
        unsafe { alloc::dealloc(block.base() as *mut u8, Self::layout(block.size)) }
    }
}
