//! 执行上下文核心模块
//!
//! # Overview
//! - `record`：活动记录的创建、切换、到达处理与销毁
//! - `processor`：每线程的当前记录
//! - `id`：记录 ID 的分配与回收
//!
//! 上层的 `Continuation` / `Fiber` 只通过本模块导出的接口切换。

mod id;
mod processor;
mod record;

pub use processor::current_id;

pub(crate) use processor::{current, try_current};
pub(crate) use record::{
    arrive, check_resumable, transfer, ActivationRecord, ContextFn, Packet, Payload,
};
