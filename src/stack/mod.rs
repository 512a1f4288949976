//! 栈内存管理模块
//!
//! # Overview
//! 本模块为执行上下文提供栈内存。每个活动记录独占一块 `StackBlock`，
//! 由实现了 `StackAllocator` 的分配器分配与回收。
//!
//! # Design
//! - 栈向低地址增长，`StackBlock` 记录栈顶地址与总大小。
//! - 保护页位于块的最低端，栈溢出会触发访问错误而不是静默破坏相邻内存。
//! - 提供三种分配器：
//!     - `ProtectedFixedSizeStack`：`mmap` 分配，带保护页（默认）
//!     - `FixedSizeStack`：堆分配，无保护页
//!     - `PooledFixedSizeStack`：回收复用已释放的栈块
//! - `Preallocated` 允许调用方在栈顶预留一段自用空间，控制块放在其下方。
//!
//! # Invariants
//! - `StackBlock` 只可移动，不可复制，一块内存只会被归还一次。
//! - 块必须归还给分配它的分配器。

mod fixed;
mod pooled;
mod protected;

pub use fixed::FixedSizeStack;
pub use pooled::PooledFixedSizeStack;
pub use protected::ProtectedFixedSizeStack;

use crate::config::{StackTraits, STACK_ALIGN};
use crate::error::ContextError;

/// 一段栈内存
///
/// # Fields
/// - `top`：最高地址（不含），初始栈指针从这里向下增长
/// - `size`：总字节数，包含保护页
/// - `guard`：最低端不可访问的字节数
#[derive(Debug)]
pub struct StackBlock {
    top: usize,
    size: usize,
    guard: usize,
}

impl StackBlock {
    /// 由自定义分配器构造栈块
    ///
    /// # Safety
    /// - `[top - size, top)` 必须是一段由调用方独占的内存，
    ///   其中高 `size - guard` 字节可读写
    /// - `top` 必须按 16 字节对齐
    pub unsafe fn from_raw_parts(top: *mut u8, size: usize, guard: usize) -> Self {
        debug_assert!(guard <= size);
        debug_assert_eq!(top as usize % STACK_ALIGN, 0);
        Self {
            top: top as usize,
            size,
            guard,
        }
    }

    /// 栈顶地址
    pub fn top(&self) -> *mut u8 {
        self.top as *mut u8
    }

    /// 总大小，包含保护页
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn guard_size(&self) -> usize {
        self.guard
    }

    /// 可用于执行的字节数
    pub fn usable_size(&self) -> usize {
        self.size - self.guard
    }

    /// 整块内存的最低地址
    pub(crate) fn base(&self) -> usize {
        self.top - self.size
    }

    /// 可访问区域的最低地址
    pub(crate) fn limit(&self) -> usize {
        self.top - self.usable_size()
    }
}

/// 栈分配器
///
/// 分配器的大小属性在构造时确定，之后每次 `allocate` 返回同样大小的块。
pub trait StackAllocator {
    /// 分配一块栈，失败时在任何用户代码运行之前返回
    fn allocate(&self) -> Result<StackBlock, ContextError>;

    /// 归还一块由本分配器分配的栈
    fn deallocate(&self, block: StackBlock);
}

impl<S: StackAllocator + ?Sized> StackAllocator for Box<S> {
    fn allocate(&self) -> Result<StackBlock, ContextError> {
        (**self).allocate()
    }

    fn deallocate(&self, block: StackBlock) {
        (**self).deallocate(block)
    }
}

/// 预分配的栈区域
///
/// 控制块放在 `sp` 处而不是块顶，`[sp, top)` 留给调用方自用。
#[derive(Debug)]
pub struct Preallocated {
    pub(crate) sp: usize,
    pub(crate) block: StackBlock,
}

impl Preallocated {
    /// 在 `block` 顶端预留 `reserved` 字节
    ///
    /// 剩余的可用空间小于最小栈大小时返回 `InvalidStackSize`，并把块交还给调用方。
    pub fn new(block: StackBlock, reserved: usize) -> Result<Self, (ContextError, StackBlock)> {
        let reserved = (reserved + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);
        let remaining = block.usable_size().saturating_sub(reserved);
        if remaining < StackTraits::minimum_size() {
            let err = ContextError::InvalidStackSize {
                size: remaining,
                min: StackTraits::minimum_size(),
                max: StackTraits::maximum_size(),
            };
            return Err((err, block));
        }
        Ok(Self {
            sp: block.top - reserved,
            block,
        })
    }

    /// 预留区域的起始地址，在对应上下文销毁之前有效
    pub fn reserved(&self) -> *mut u8 {
        self.sp as *mut u8
    }

    /// 预留区域之下可用于执行的字节数
    pub fn size(&self) -> usize {
        self.sp - self.block.limit()
    }
}

/// 校验请求的栈大小（不含保护页）
pub(crate) fn check_size(size: usize) -> Result<(), ContextError> {
    let min = StackTraits::minimum_size();
    let max = StackTraits::maximum_size();
    if size < min || max.is_some_and(|max| size > max) {
        return Err(ContextError::InvalidStackSize { size, min, max });
    }
    Ok(())
}
