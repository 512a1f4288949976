//! 每线程执行状态模块
//!
//! 本模块定义了 `Processor` 结构体，描述单个 OS 线程上
//! “当前正在运行哪一个活动记录”。
//!
//! # Overview
//! - 每个 OS 线程对应一个线程局部的 `Processor` 实例，第一次使用时惰性创建
//! - `Processor` 持有本线程的原生栈对应的活动记录（origin record）
//! - 切换时由 `record::transfer` 更新 `current`
//!
//! # Concurrency Model
//! - `Processor` 只会被所属线程访问，不需要锁
//! - 同一线程上的不同栈共享同一个 `Processor`，但任意时刻只有一个栈在执行
//!
//! # Invariants
//! - 任意时刻，`current` 指向本线程上唯一处于运行状态的活动记录
//! - origin record 永远不会被释放栈，只在线程退出时随 `Processor` 一起销毁
//! - 线程退出时 `current` 应当回到 origin record

use std::cell::Cell;
use std::thread::{self, ThreadId};

use super::record::ActivationRecord;

/// Processor 表示一个 OS 线程的切换状态。
///
/// # Design
/// - 每个线程恰好对应一个 `Processor`
/// - `Processor` 不会在线程之间迁移
pub(crate) struct Processor {
    /// 当前正在运行的活动记录。
    ///
    /// INVARIANT:
    /// - 永远非空；初始为 origin record
    current: Cell<*const ActivationRecord>,

    /// 本线程原生栈对应的活动记录。
    origin: Box<ActivationRecord>,

    thread: ThreadId,
}

impl Processor {
    /// 创建一个新的 Processor。
    ///
    /// 初始状态下当前记录就是本线程的 origin record。
    fn new() -> Self {
        let thread = thread::current().id();
        let origin = Box::new(ActivationRecord::origin(thread));
        let current = Cell::new(&*origin as *const ActivationRecord);
        log::trace!(
            "[processor] thread {:?} registered origin record {}",
            thread,
            origin.id()
        );
        Self {
            current,
            origin,
            thread,
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        let origin = &*self.origin as *const ActivationRecord;
        if self.current.get() != origin {
            // 线程函数只能从原生栈上返回，走到这里说明协议已被破坏
            log::error!(
                "[processor] thread {:?} exits while record {} is current",
                self.thread,
                // SAFETY: 非 origin 的当前记录仍位于其栈上
                unsafe { (*self.current.get()).id() }
            );
        }
    }
}

thread_local! {
    /// 本线程的 Processor 实例。
    ///
    /// INVARIANT:
    /// - 每个线程只存在一个 `Processor`
    static PROCESSOR: Processor = Processor::new();
}

/// 获得当前正在运行的活动记录
pub(crate) fn current() -> *const ActivationRecord {
    PROCESSOR.with(|p| p.current.get())
}

/// 线程局部存储已销毁时返回 `None`
pub(crate) fn try_current() -> Option<*const ActivationRecord> {
    PROCESSOR.try_with(|p| p.current.get()).ok()
}

/// 设置当前正在运行的活动记录，只在切换前调用
pub(crate) fn set_current(record: *const ActivationRecord) {
    PROCESSOR.with(|p| p.current.set(record))
}

/// 当前线程的 ID
pub(crate) fn thread_id() -> ThreadId {
    PROCESSOR.with(|p| p.thread)
}

/// 当前正在运行的活动记录的 ID
pub fn current_id() -> usize {
    // SAFETY: 当前记录正在运行，一定有效
    unsafe { (*current()).id() }
}
