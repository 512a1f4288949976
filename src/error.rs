//! 错误类型
//!
//! # Overview
//! - `ContextError`：创建上下文时可恢复的错误（栈分配失败、栈大小非法），
//!   以及以类型化形式报告的协议违规。
//! - `Violation`：协议违规的种类。违规属于编程错误，不会被静默忽略：
//!   在调用方栈上检测到时记录日志后 panic，在上下文栈底检测到时直接 abort。

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    /// 栈分配器无法满足请求，在任何用户代码运行之前返回
    #[error("failed to allocate a stack of {size} bytes: {source}")]
    AllocationFailure {
        size: usize,
        #[source]
        source: io::Error,
    },
    /// 请求的栈大小超出平台约束
    #[error("stack size {size} is outside of [{min}, {max:?}]")]
    InvalidStackSize {
        size: usize,
        min: usize,
        max: Option<usize>,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("resumed an empty handle")]
    EmptyHandle,
    #[error("resumed a terminated context")]
    Terminated,
    #[error("resumed the context that is currently running")]
    AlreadyRunning,
    #[error("context is owned by another thread and is not migratable")]
    NotMigratable,
    #[error("no data available on this handle")]
    NoData,
    #[error("payload is not of type `{0}`")]
    DataType(&'static str),
    #[error("context function returned an empty handle")]
    EmptyReturn,
}

/// 在调用方栈上报告协议违规
#[cold]
#[track_caller]
pub(crate) fn violation(kind: Violation) -> ! {
    log::error!("[violation] {}", kind);
    panic!("{}", ContextError::ProtocolViolation(kind));
}

/// 在上下文栈底报告协议违规，此处没有可以接住 panic 的调用方
#[cold]
pub(crate) fn fatal(kind: Violation) -> ! {
    log::error!("[violation] {}, aborting", kind);
    std::process::abort();
}
