//! 手写汇编后端
//!
//! 每种架构一个子模块，各自提供 `switch.S` 与初始栈帧布局。
//! 编译期根据 `target_arch` 选择，未支持的架构直接报错。

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::init_frame;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::init_frame;

#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(target_arch = "riscv64")]
pub use self::riscv64::init_frame;

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64"
)))]
compile_error!("the `fcontext` backend supports x86_64, aarch64 and riscv64 only");

use super::{EntryFn, StatePtr, Transfer};
use crate::config::STACK_ALIGN;

extern "C" {
    /// 保存当前寄存器到当前栈上，切换到 `to` 并恢复其寄存器
    ///
    /// # Arguments
    /// - `to`：目标上下文的状态令牌
    /// - `data`：携带给目标的数据
    ///
    /// # Returns
    /// 以后某个上下文切换回来时，返回对方的状态令牌与数据
    fn stackctx_jump(to: StatePtr, data: usize) -> Transfer;

    /// 新上下文第一次被恢复时的落脚点，负责以正确的栈对齐调用入口函数
    fn stackctx_trampoline();
}

/// 在栈顶 `top` 之下构造初始栈帧，返回状态令牌
///
/// # Safety
/// - `[top - size, top)` 必须是可写的栈内存
/// - `top` 必须按 16 字节对齐
pub unsafe fn make_context(top: usize, _size: usize, entry: EntryFn) -> StatePtr {
    debug_assert_eq!(top % STACK_ALIGN, 0);
    init_frame(top, entry as usize, stackctx_trampoline as usize)
}

/// 切换到 `to`
///
/// # Safety
/// - `to` 必须是尚未被恢复过的有效状态令牌
#[inline(always)]
pub unsafe fn jump_context(to: StatePtr, data: usize) -> Transfer {
    stackctx_jump(to, data)
}
