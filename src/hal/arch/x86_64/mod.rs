//! x86_64 System V 上下文切换
//!
//! # Design
//! - 汇编文件 `switch.S` 提供 `stackctx_jump` 与 `stackctx_trampoline`。
//! - 保存的内容：callee-saved 寄存器 rbx、rbp、r12~r15，MXCSR 与 x87 控制字，返回地址。
//! - 状态令牌就是保存完寄存器之后的栈指针。
//!
//! # Layout
//! 状态令牌指向的栈帧（低地址在上）：
//! ```text
//! +0x00  mxcsr (u32) | x87 cw (u16)
//! +0x08  r12
//! +0x10  r13
//! +0x18  r14
//! +0x20  r15
//! +0x28  rbx      新上下文中存放入口函数地址
//! +0x30  rbp
//! +0x38  返回地址  新上下文中为 trampoline
//! ```

use core::arch::global_asm;

use crate::hal::StatePtr;

// 引入汇编实现
global_asm!(include_str!("switch.S"));

/// 初始帧大小，多出的 16 字节保证 trampoline 调用入口前 rsp 16 字节对齐
const FRAME_SIZE: usize = 0x50;

const MXCSR_DEFAULT: u32 = 0x1f80;
const FPU_CW_DEFAULT: u16 = 0x037f;

pub unsafe fn init_frame(top: usize, entry: usize, trampoline: usize) -> StatePtr {
    let frame = (top - FRAME_SIZE) as *mut u8;
    core::ptr::write_bytes(frame, 0, FRAME_SIZE);
    (frame as *mut u32).write(MXCSR_DEFAULT);
    (frame.add(4) as *mut u16).write(FPU_CW_DEFAULT);
    (frame.add(0x28) as *mut usize).write(entry);
    (frame.add(0x38) as *mut usize).write(trampoline);
    frame
}
