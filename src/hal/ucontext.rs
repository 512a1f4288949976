//! POSIX `ucontext` 后端
//!
//! # Overview
//! 使用 `getcontext` / `makecontext` / `swapcontext` 实现与汇编后端相同的 `Transfer` 语义。
//!
//! # Design
//! - 状态令牌是指向 `ucontext_t` 的指针：
//!     - 新上下文的 `ucontext_t` 放在其栈顶（`Frame`），同时记录入口函数；
//!     - 挂起中的上下文的 `ucontext_t` 是 `jump_context` 栈帧中的局部变量，
//!       在该次调用返回之前一直有效，正好覆盖令牌的生命周期。
//! - `swapcontext` 无法携带返回值，切换数据经由线程局部的 `SLOT` 传递。
//!
//! # Safety
//! - 与汇编后端相同：令牌只能恢复一次，入口函数不能返回。
//! - `swapcontext` 会保存/恢复信号掩码，每次切换都有一次系统调用。

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("the `ucontext` backend requires linux with glibc");

use std::cell::Cell;
use std::mem::{self, MaybeUninit};
use std::ptr;

use super::{EntryFn, StatePtr, Transfer};
use crate::config::STACK_ALIGN;

thread_local! {
    /// 最近一次切换的 (目标, 结果)
    static SLOT: Cell<(StatePtr, Transfer)> = const {
        Cell::new((
            ptr::null_mut(),
            Transfer {
                from: ptr::null_mut(),
                data: 0,
            },
        ))
    };
}

/// 新上下文栈顶的初始帧
#[repr(C)]
struct Frame {
    uc: libc::ucontext_t,
    entry: EntryFn,
}

/// 在栈顶 `top` 之下构造 `Frame`，返回其中 `ucontext_t` 的地址
///
/// # Safety
/// - `[top - size, top)` 必须是可写的栈内存
pub unsafe fn make_context(top: usize, size: usize, entry: EntryFn) -> StatePtr {
    let bottom = top - size;
    let frame_addr = (top - mem::size_of::<Frame>()) & !(STACK_ALIGN - 1);
    let frame = frame_addr as *mut Frame;

    // getcontext 会让 uc_mcontext 指向结构体自身的字段，必须原地初始化
    ptr::addr_of_mut!((*frame).entry).write(entry);
    let uc = ptr::addr_of_mut!((*frame).uc);
    ptr::write_bytes(uc, 0, 1);
    if libc::getcontext(uc) != 0 {
        log::error!("[ucontext] getcontext failed, aborting");
        std::process::abort();
    }
    (*uc).uc_stack.ss_sp = bottom as *mut libc::c_void;
    (*uc).uc_stack.ss_size = frame_addr - bottom;
    (*uc).uc_stack.ss_flags = 0;
    (*uc).uc_link = ptr::null_mut();

    libc::makecontext(uc, trampoline, 0);
    frame as StatePtr
}

/// 切换到 `to`
///
/// # Safety
/// - `to` 必须是尚未被恢复过的有效状态令牌
pub unsafe fn jump_context(to: StatePtr, data: usize) -> Transfer {
    let mut from = MaybeUninit::<libc::ucontext_t>::zeroed();
    let from_ptr = from.as_mut_ptr();
    SLOT.with(|slot| {
        slot.set((
            to,
            Transfer {
                from: from_ptr as StatePtr,
                data,
            },
        ))
    });
    if libc::swapcontext(from_ptr, to as *const libc::ucontext_t) != 0 {
        log::error!("[ucontext] swapcontext failed, aborting");
        std::process::abort();
    }
    SLOT.with(|slot| slot.get().1)
}

extern "C" fn trampoline() {
    let (target, transfer) = SLOT.with(|slot| slot.get());
    // SAFETY: 第一次恢复新上下文时 target 就是 make_context 返回的 Frame
    let entry = unsafe { (*(target as *const Frame)).entry };
    entry(transfer)
}
