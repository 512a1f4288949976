//! RISC-V 64 (LP64D) 上下文切换
//!
//! # Design
//! - 保存 ra、s0~s11、fs0~fs11，帧大小 0xd0（保持 16 字节对齐）。
//! - 状态令牌是保存完寄存器之后的 sp。
//! - 新上下文：ra 指向 trampoline，s1 存放入口函数，s0（fp）清零。

use core::arch::global_asm;

use crate::hal::StatePtr;

// 引入汇编实现
global_asm!(include_str!("switch.S"));

const FRAME_SIZE: usize = 0xd0;
const RA_OFFSET: usize = 0x00;
const S1_OFFSET: usize = 0x10;

pub unsafe fn init_frame(top: usize, entry: usize, trampoline: usize) -> StatePtr {
    let frame = (top - FRAME_SIZE) as *mut u8;
    core::ptr::write_bytes(frame, 0, FRAME_SIZE);
    (frame.add(RA_OFFSET) as *mut usize).write(trampoline);
    (frame.add(S1_OFFSET) as *mut usize).write(entry);
    frame
}
