//! AArch64 (AAPCS64) 上下文切换
//!
//! # Design
//! - 保存 x19~x30 与 d8~d15，共 0xa0 字节。
//! - 状态令牌是保存完寄存器之后的 sp。
//! - 新上下文：x19 存放入口函数，x30 指向 trampoline，x29 清零作为帧链终点。

use core::arch::global_asm;

use crate::hal::StatePtr;

// 引入汇编实现
global_asm!(include_str!("switch.S"));

const FRAME_SIZE: usize = 0xa0;
const X19_OFFSET: usize = 0x40;
const X30_OFFSET: usize = 0x98;

pub unsafe fn init_frame(top: usize, entry: usize, trampoline: usize) -> StatePtr {
    let frame = (top - FRAME_SIZE) as *mut u8;
    core::ptr::write_bytes(frame, 0, FRAME_SIZE);
    (frame.add(X19_OFFSET) as *mut usize).write(entry);
    (frame.add(X30_OFFSET) as *mut usize).write(trampoline);
    frame
}
