//! 栈展开模块
//!
//! # Overview
//! - `ForcedUnwind`：句柄销毁时，在被销毁的上下文栈上抛出的展开信号。
//!   它携带指向销毁方的句柄，展开到栈底后上下文切换回销毁方。
//! - `OntopError`：ontop 闭包中的 panic 在目标栈上的包装。
//!
//! # Design
//! - 两种信号都用 `panic::resume_unwind` 抛出，不会触发 panic hook。
//! - 用户代码中的 `catch_unwind` 可能截获 `ForcedUnwind`，
//!   用 `is_forced_unwind` 识别后必须原样重新抛出，否则上下文无法终止。
//! - 以 `panic = "abort"` 编译时无法展开：销毁未终止的句柄只会泄漏其栈并记录警告。
//!
//! # Invariants
//! - 上下文函数之外的 panic 不会越过栈底：`ForcedUnwind` 与可恢复的 `OntopError`
//!   在栈底被接住，其余 panic 导致进程 abort。

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::thread;

use crate::context::{self, ActivationRecord, ContextFn, Payload};
use crate::continuation::Continuation;

/// 强制展开信号
///
/// 只能由本库构造。截获后必须用 `std::panic::resume_unwind` 重新抛出。
pub struct ForcedUnwind {
    target: Continuation,
}

// SAFETY: 信号只在同一线程的栈之间传递，`Send` 仅用于满足 panic 载荷的约束
unsafe impl Send for ForcedUnwind {}

impl ForcedUnwind {
    pub(crate) fn new(target: Continuation) -> Self {
        Self { target }
    }

    fn into_target(self) -> Continuation {
        self.target
    }
}

impl fmt::Debug for ForcedUnwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForcedUnwind")
            .field("target", &self.target.id())
            .finish()
    }
}

/// 判断一个 panic 载荷是否为强制展开信号
pub fn is_forced_unwind(payload: &(dyn Any + Send)) -> bool {
    payload.is::<ForcedUnwind>()
}

/// ontop 闭包中的 panic
///
/// 在目标栈上抛出。如果闭包的参数句柄在 panic 中被释放，
/// 可以用 `take_origin` 取回指向发起方的句柄。
/// 目标上下文没有处理它时，panic 在发起方的 `resume_with` 处重新抛出。
pub struct OntopError {
    payload: Payload,
    origin: Option<Continuation>,
}

// SAFETY: 同 `ForcedUnwind`，`origin` 只在同一线程上使用
unsafe impl Send for OntopError {}

impl OntopError {
    /// 原始 panic 载荷
    pub fn payload(&self) -> &(dyn Any + Send) {
        &*self.payload
    }

    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// 取回指向发起 `resume_with` 一方的句柄
    pub fn take_origin(&mut self) -> Option<Continuation> {
        self.origin.take()
    }
}

impl fmt::Debug for OntopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OntopError")
            .field("payload", &describe(&*self.payload))
            .field("origin", &self.origin)
            .finish()
    }
}

/// 在当前记录 `me` 上执行 ontop 闭包
pub(crate) fn invoke_ontop(
    me: &ActivationRecord,
    f: ContextFn,
    incoming: Continuation,
) -> Continuation {
    let origin = incoming.raw();
    let origin_ptr: *const ActivationRecord = match origin {
        Some(r) => r.as_ptr(),
        None => std::ptr::null(),
    };
    let previous = me.arm_ontop(origin_ptr);
    let result = panic::catch_unwind(AssertUnwindSafe(move || f(incoming)));
    let released = me.disarm_ontop(previous);

    let payload = match result {
        Ok(next) => return next,
        Err(payload) => payload,
    };
    let origin = if released {
        origin.map(|r| Continuation::from_parts(Some(r), None))
    } else {
        None
    };
    if is_forced_unwind(&*payload) {
        // 闭包中挂起后被销毁，来源记录同样需要展开
        drop(origin);
        panic::resume_unwind(payload);
    }
    panic::resume_unwind(Box::new(OntopError { payload, origin }))
}

/// 栈底接住的 panic 决定记录终止后切换到哪里
///
/// # Returns
/// (终止后切换到的句柄, 需要在对方栈上重新抛出的 panic)
pub(crate) fn exit_target(payload: Payload) -> (Continuation, Option<Payload>) {
    let payload = match payload.downcast::<ForcedUnwind>() {
        Ok(signal) => return (signal.into_target(), None),
        Err(payload) => payload,
    };
    match payload.downcast::<OntopError>() {
        Ok(mut err) => match err.take_origin() {
            Some(origin) => (origin, Some(err as Payload)),
            None => {
                log::error!(
                    "[unwind] ontop panic escaped record {} with no way back: {}",
                    context::current_id(),
                    describe(&*err.payload)
                );
                std::process::abort();
            }
        },
        Err(payload) => {
            log::error!(
                "[unwind] panic escaped record {}: {}",
                context::current_id(),
                describe(&*payload)
            );
            std::process::abort();
        }
    }
}

/// 销毁指向挂起记录的句柄
///
/// 能够展开时切换过去展开它的栈，之后由它切换回来；否则泄漏并记录日志。
///
/// # Safety
/// - `target` 必须来自一个即将销毁的句柄
pub(crate) unsafe fn drop_suspended(target: NonNull<ActivationRecord>) {
    let rec = target.as_ref();
    let Some(current) = context::try_current() else {
        log::warn!("[unwind] thread is exiting, leaking record {}", rec.id());
        return;
    };
    if thread::panicking() && (*current).release_ontop_origin(target.as_ptr()) {
        return;
    }
    if rec.is_origin() {
        log::warn!(
            "[unwind] handle to the origin record {} dropped, the thread can no longer be resumed",
            rec.id()
        );
        return;
    }
    if !cfg!(panic = "unwind") {
        log::warn!(
            "[unwind] unwinding is unavailable, leaking record {}",
            rec.id()
        );
        return;
    }
    if let Err(kind) = context::check_resumable(rec) {
        log::error!(
            "[unwind] cannot unwind record {}: {}, leaking",
            rec.id(),
            kind
        );
        return;
    }

    rec.request_unwind();
    let rest = Continuation::from_parts(Some(target), None).resume_inner(None, None);
    // 展开结束后对方直接终止，通常得到空句柄
    drop(rest);
}

/// panic 载荷的可读描述
pub(crate) fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if payload.is::<ForcedUnwind>() {
        "forced unwind".to_string()
    } else {
        "Box<dyn Any>".to_string()
    }
}
