//! 切换原语统一接口模块
//! # Overview
//! 本模块根据编译特性选择唯一的底层切换实现（手写汇编 `fcontext` 或 POSIX `ucontext`），
//! 并统一导出上层需要的接口。上层只通过 `make_context` / `jump_context` 访问机器状态，
//! 不关心具体后端细节。
//!
//! # Design
//! - 使用 `#[cfg(feature = "...")]` 在编译期选择后端，运行期不存在多态分派。
//! - 两个特性同时打开时以 `ucontext` 为准。
//! - 统一导出：
//!     - `Transfer`：一次切换的结果，包含切换过来的一方的状态令牌与数据
//!     - `make_context`：在一段栈内存上构造初始上下文
//!     - `jump_context`：保存当前上下文并恢复目标上下文
//!
//! # Safety
//! - 状态令牌只能被恢复一次；恢复后令牌立即失效。
//! - 新上下文的入口函数绝不能返回，也不能让 panic 越过入口函数。
//!
//! # Invariants
//! - 各后端对 `Transfer` 的语义完全一致，上层无法观察到差别。

#[cfg(all(feature = "fcontext", not(feature = "ucontext")))]
pub mod arch;

#[cfg(all(feature = "fcontext", not(feature = "ucontext")))]
pub use arch::{jump_context, make_context};

#[cfg(feature = "ucontext")]
pub mod ucontext;

#[cfg(feature = "ucontext")]
pub use ucontext::{jump_context, make_context};

#[cfg(not(any(feature = "fcontext", feature = "ucontext")))]
compile_error!("one of the `fcontext` or `ucontext` features must be enabled");

/// 挂起上下文的不透明状态令牌
pub type StatePtr = *mut u8;

/// 新上下文的入口函数，第一次被恢复时以 `Transfer` 为参数调用
pub type EntryFn = extern "C" fn(Transfer) -> !;

/// 一次切换的结果
///
/// - `from`：切换到当前上下文的一方的状态令牌，用于以后切换回去
/// - `data`：对方携带过来的数据
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    pub from: StatePtr,
    pub data: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{FixedSizeStack, StackAllocator};

    extern "C" fn echo(mut t: Transfer) -> ! {
        loop {
            // SAFETY: t.from 是刚刚切换过来的一方
            t = unsafe { jump_context(t.from, t.data + 1) };
        }
    }

    #[test]
    fn test_jump_round_trip() {
        let salloc = FixedSizeStack::default();
        let block = salloc.allocate().unwrap();
        let top = block.top() as usize;
        // SAFETY: 块由本测试独占，echo 挂起后不再恢复
        let mut state = unsafe { make_context(top, block.usable_size(), echo) };
        for i in 0..3 {
            let t = unsafe { jump_context(state, i) };
            assert_eq!(t.data, i + 1);
            state = t.from;
        }
        salloc.deallocate(block);
    }
}
