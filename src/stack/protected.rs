//! 带保护页的栈分配器
//!
//! # Overview
//! 使用 `mmap` 申请匿名内存，并把最低一页设为不可访问，用作保护页。
//!
//! # Design
//! - 请求大小先向上取整到页边界，再额外加一页保护页。
//! - 栈从块顶向低地址增长，溢出时首先触碰保护页并产生段错误。
//! - 归还时整体 `munmap`。
//!
//! # Safety
//! - `mmap` / `mprotect` / `munmap` 直接操作地址空间，
//!   只对本分配器产生的块调用 `deallocate`。

use std::io;
use std::ptr;

use super::{check_size, StackAllocator, StackBlock};
use crate::config::StackTraits;
use crate::error::ContextError;

#[cfg(target_os = "linux")]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
#[cfg(not(target_os = "linux"))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

/// 带保护页的固定大小栈分配器
#[derive(Debug, Clone, Copy)]
pub struct ProtectedFixedSizeStack {
    size: usize,
}

impl ProtectedFixedSizeStack {
    /// 创建一个分配 `size` 字节可用空间的分配器
    pub fn new(size: usize) -> Result<Self, ContextError> {
        check_size(size)?;
        Ok(Self {
            size: StackTraits::round_to_page(size),
        })
    }

    /// 每块可用空间大小（不含保护页）
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Default for ProtectedFixedSizeStack {
    fn default() -> Self {
        Self {
            size: StackTraits::round_to_page(StackTraits::default_size()),
        }
    }
}

impl StackAllocator for ProtectedFixedSizeStack {
    fn allocate(&self) -> Result<StackBlock, ContextError> {
        let guard = StackTraits::page_size();
        let total = self.size + guard;

        // SAFETY: 申请新的匿名映射，不影响已有内存
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ContextError::AllocationFailure {
                size: total,
                source: io::Error::last_os_error(),
            });
        }

        // 最低一页设为保护页
        // SAFETY: [base, base + guard) 属于刚刚建立的映射
        if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
            let source = io::Error::last_os_error();
            unsafe {
                libc::munmap(base, total);
            }
            return Err(ContextError::AllocationFailure {
                size: total,
                source,
            });
        }

        let top = base as usize + total;
        log::trace!("[protected_stack] mapped {:#x}..{:#x}", base as usize, top);
        // SAFETY: 映射由本分配器独占，高 `self.size` 字节可读写，页对齐满足 16 字节对齐
        Ok(unsafe { StackBlock::from_raw_parts(top as *mut u8, total, guard) })
    }

    fn deallocate(&self, block: StackBlock) {
        log::trace!(
            "[protected_stack] unmapped {:#x}..{:#x}",
            block.base(),
            block.top
        );
        // SAFETY: 块来自本分配器的 allocate，整体解除映射
        unsafe {
            libc::munmap(block.base() as *mut libc::c_void, block.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_has_guard_page() {
        let salloc = ProtectedFixedSizeStack::default();
        let block = salloc.allocate().unwrap();
        assert_eq!(block.guard_size(), StackTraits::page_size());
        assert_eq!(block.usable_size(), salloc.size());
        assert_eq!(block.top() as usize % StackTraits::page_size(), 0);
        salloc.deallocate(block);
    }

    #[test]
    fn test_usable_region_is_writable() {
        let salloc = ProtectedFixedSizeStack::new(StackTraits::minimum_size()).unwrap();
        let block = salloc.allocate().unwrap();
        unsafe {
            let low = block.limit() as *mut u8;
            low.write(0xaa);
            block.top().sub(1).write(0x55);
            assert_eq!(low.read(), 0xaa);
        }
        salloc.deallocate(block);
    }

    #[test]
    fn test_rejects_tiny_size() {
        assert!(matches!(
            ProtectedFixedSizeStack::new(16),
            Err(ContextError::InvalidStackSize { size: 16, .. })
        ));
    }
}
