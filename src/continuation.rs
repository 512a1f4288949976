//! 执行上下文句柄
//!
//! # Overview
//! `Continuation` 是指向一个挂起活动记录的只可移动句柄。恢复一个句柄会消耗它，
//! 当控制权切换回来时，得到指向切换回来一方的新句柄。
//!
//! # Design
//! - 句柄不可复制，`resume*` 按值接收 `self`，一个挂起的记录至多只有一个句柄。
//! - 数据随句柄一起到达，用 `get_data` 按类型取出。
//! - 句柄销毁时，如果指向的记录尚未终止，会强制展开该记录的栈并释放它。
//! - 句柄不能跨线程传递（`!Send`），跨线程请使用 `Fiber`。
//!
//! # Invariants
//! - 空句柄不指向任何记录，但可能携带上下文函数返回时附带的数据。
//! - 一个句柄被恢复后，旧的句柄值已被移走，无法再使用。

use std::any::{self, Any};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::context::{self, ActivationRecord, ContextFn, Packet, Payload};
use crate::error::{violation, ContextError, Violation};
use crate::stack::{Preallocated, ProtectedFixedSizeStack, StackAllocator};
use crate::unwind::{self, ForcedUnwind};

/// 指向挂起执行上下文的句柄
pub struct Continuation {
    record: Option<NonNull<ActivationRecord>>,
    data: Option<Payload>,
    _not_send: PhantomData<*mut ()>,
}

impl Continuation {
    /// 使用默认的带保护页栈创建上下文
    ///
    /// 上下文挂起在入口处，第一次 `resume` 时才开始执行 `f`。
    /// `f` 返回的句柄就是终止时要切换到的上下文。
    pub fn new<F>(f: F) -> Result<Self, ContextError>
    where
        F: FnOnce(Continuation) -> Continuation + 'static,
    {
        Self::with_stack(ProtectedFixedSizeStack::default(), f)
    }

    /// 使用指定的栈分配器创建上下文
    pub fn with_stack<S, F>(salloc: S, f: F) -> Result<Self, ContextError>
    where
        S: StackAllocator + 'static,
        F: FnOnce(Continuation) -> Continuation + 'static,
    {
        Self::spawn(None, Box::new(salloc), Box::new(f), false)
    }

    /// 在预分配的栈区域上创建上下文
    ///
    /// 上下文销毁时 `palloc` 的栈块交还给 `salloc`。
    pub fn with_preallocated<S, F>(
        palloc: Preallocated,
        salloc: S,
        f: F,
    ) -> Result<Self, ContextError>
    where
        S: StackAllocator + 'static,
        F: FnOnce(Continuation) -> Continuation + 'static,
    {
        Self::spawn(Some(palloc), Box::new(salloc), Box::new(f), false)
    }

    pub(crate) fn spawn(
        palloc: Option<Preallocated>,
        salloc: Box<dyn StackAllocator>,
        entry: ContextFn,
        migratable: bool,
    ) -> Result<Self, ContextError> {
        let record = ActivationRecord::create(palloc, salloc, entry, migratable)?;
        Ok(Self::from_parts(Some(record), None))
    }

    /// 切换到句柄指向的上下文
    ///
    /// # Panics
    /// 句柄为空、上下文已终止或正在运行、或上下文属于其它线程且不可迁移时 panic。
    pub fn resume(self) -> Continuation {
        self.resume_inner(None, None)
    }

    /// 携带数据切换，对方通过 `get_data` 取出
    pub fn resume_with_data<T: Any + Send>(self, data: T) -> Continuation {
        self.resume_inner(Some(Box::new(data)), None)
    }

    /// 切换过去，并在目标栈上、返回目标代码之前执行 `f`
    ///
    /// `f` 的参数是指向当前上下文的句柄，`f` 的返回值作为目标挂起点的返回值。
    /// `f` 中的 panic 在目标栈上以 `OntopError` 抛出。
    pub fn resume_with<F>(self, f: F) -> Continuation
    where
        F: FnOnce(Continuation) -> Continuation + 'static,
    {
        self.resume_inner(None, Some(Box::new(f)))
    }

    /// 同时携带数据并执行 ontop 闭包，数据在 `f` 的参数句柄上
    pub fn resume_ontop_with_data<T, F>(self, data: T, f: F) -> Continuation
    where
        T: Any + Send,
        F: FnOnce(Continuation) -> Continuation + 'static,
    {
        self.resume_inner(Some(Box::new(data)), Some(Box::new(f)))
    }

    pub fn is_empty(&self) -> bool {
        self.record.is_none()
    }

    pub fn is_resumable(&self) -> bool {
        !self.is_empty()
    }

    pub fn data_available(&self) -> bool {
        self.data.is_some()
    }

    /// 指向的活动记录的 ID，空句柄返回 `None`
    pub fn id(&self) -> Option<usize> {
        // SAFETY: 句柄存在期间记录不会被销毁
        self.record.map(|r| unsafe { r.as_ref() }.id())
    }

    /// 是否可以在当前线程上恢复
    pub fn can_resume(&self) -> bool {
        // SAFETY: 同上
        self.record
            .is_some_and(|r| unsafe { r.as_ref() }.can_resume())
    }

    /// 是否可以在任意线程上恢复：尚未启动，或显式允许迁移
    pub fn can_resume_from_any_thread(&self) -> bool {
        // SAFETY: 同上
        self.record
            .is_some_and(|r| unsafe { r.as_ref() }.can_resume_from_any_thread())
    }

    /// 取出随句柄到达的数据
    ///
    /// # Panics
    /// 没有数据，或数据不是 `T` 类型时 panic。
    #[track_caller]
    pub fn get_data<T: Any>(&mut self) -> T {
        match self.try_get_data() {
            Ok(data) => data,
            Err(ContextError::ProtocolViolation(kind)) => violation(kind),
            Err(_) => unreachable!(),
        }
    }

    /// 取出随句柄到达的数据，类型不符时数据保留在句柄上
    pub fn try_get_data<T: Any>(&mut self) -> Result<T, ContextError> {
        let data = self.data.take().ok_or(Violation::NoData)?;
        match data.downcast::<T>() {
            Ok(data) => Ok(*data),
            Err(data) => {
                self.data = Some(data);
                Err(Violation::DataType(any::type_name::<T>()).into())
            }
        }
    }

    /// 附加数据，通常用于上下文函数的返回值
    pub fn with_data<T: Any + Send>(mut self, data: T) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    pub(crate) fn from_parts(
        record: Option<NonNull<ActivationRecord>>,
        data: Option<Payload>,
    ) -> Self {
        Self {
            record,
            data,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn into_parts(mut self) -> (Option<NonNull<ActivationRecord>>, Option<Payload>) {
        (self.record.take(), self.data.take())
    }

    pub(crate) fn raw(&self) -> Option<NonNull<ActivationRecord>> {
        self.record
    }

    pub(crate) fn resume_inner(
        self,
        data: Option<Payload>,
        ontop: Option<ContextFn>,
    ) -> Continuation {
        match self.try_resume_inner(data, ontop) {
            Ok(next) => next,
            Err((kind, rest)) => {
                // 违规的句柄不再展开，留给调用方处理 panic
                mem::forget(rest);
                violation(kind)
            }
        }
    }

    /// 检查并切换；检查失败时交还句柄
    pub(crate) fn try_resume_inner(
        mut self,
        data: Option<Payload>,
        ontop: Option<ContextFn>,
    ) -> Result<Continuation, (Violation, Continuation)> {
        let Some(target) = self.record else {
            return Err((Violation::EmptyHandle, self));
        };
        // SAFETY: 句柄存在期间记录不会被销毁
        if let Err(kind) = context::check_resumable(unsafe { target.as_ref() }) {
            return Err((kind, self));
        }
        // 未读取的数据随旧句柄一起丢弃
        self.record = None;
        drop(self);

        if let Some(f) = ontop {
            // SAFETY: 同上
            unsafe { target.as_ref() }.set_ontop(f);
        }
        let packet = Packet {
            from: context::current(),
            data,
            panic: None,
        };
        // SAFETY: 目标挂起且已通过检查
        Ok(unsafe { Self::land(context::transfer(target, packet)) })
    }

    /// 被切换到之后：处理切换包、重新抛出转发的 panic、响应展开请求、执行 ontop 闭包
    ///
    /// # Safety
    /// - `t` 必须来自 `transfer`
    pub(crate) unsafe fn land(t: crate::hal::Transfer) -> Continuation {
        let arrival = context::arrive(t);
        let incoming = Self::from_parts(arrival.from, arrival.data);
        if let Some(payload) = arrival.panic {
            drop(incoming);
            std::panic::resume_unwind(payload);
        }

        let me = &*context::current();
        if me.take_unwind_request() {
            log::debug!("[continuation] record {} is being unwound", me.id());
            std::panic::resume_unwind(Box::new(ForcedUnwind::new(incoming)));
        }
        match me.take_ontop() {
            Some(f) => unwind::invoke_ontop(me, f, incoming),
            None => incoming,
        }
    }
}

/// 以当前上下文为参数立即启动 `f`
///
/// 等价于先 `Continuation::new(f)` 再 `resume`，返回 `f` 第一次切换回来时的句柄。
pub fn callcc<F>(f: F) -> Result<Continuation, ContextError>
where
    F: FnOnce(Continuation) -> Continuation + 'static,
{
    Ok(Continuation::new(f)?.resume())
}

impl Default for Continuation {
    /// 空句柄
    fn default() -> Self {
        Self::from_parts(None, None)
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        self.data = None;
        if let Some(target) = self.record.take() {
            // SAFETY: 句柄独占指向的挂起记录
            unsafe { unwind::drop_suspended(target) }
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.id())
            .field("data_available", &self.data_available())
            .finish()
    }
}
