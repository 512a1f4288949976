//! 可跨线程传递的执行上下文句柄
//!
//! # Overview
//! `Fiber` 与 `Continuation` 语义相同，但可以发送到其它线程：
//! - 尚未启动的 fiber 可以在任意线程上恢复；
//! - 已经启动的 fiber 只能在其最近运行的线程上恢复，除非创建时显式允许迁移；
//! - 违反迁移规则时 `resume*` 返回 `MigrationError`，其中带回原句柄。
//!
//! # Safety
//! 允许迁移的 fiber 的栈上可能保存着 `!Send` 的状态，
//! 因此 `FiberBuilder::migratable` 是 `unsafe` 的，由调用方保证在其它线程上恢复它是安全的。

use std::any::Any;
use std::fmt;
use std::thread::{self, ThreadId};

use thiserror::Error;

use crate::continuation::Continuation;
use crate::error::{violation, ContextError, Violation};
use crate::stack::{Preallocated, ProtectedFixedSizeStack, StackAllocator};

/// 可跨线程传递的执行上下文句柄
pub struct Fiber {
    inner: Continuation,
}

// SAFETY: 上下文函数、数据与栈分配器都要求 `Send`；
// 恢复前检查迁移规则，启动后的非迁移 fiber 不会在其它线程上运行
unsafe impl Send for Fiber {}

/// 在其它线程上恢复一个已启动、不可迁移的 fiber
#[derive(Debug, Error)]
#[error("fiber last ran on thread {owner:?} and cannot be resumed on thread {caller:?}")]
pub struct MigrationError {
    fiber: Fiber,
    owner: ThreadId,
    caller: ThreadId,
}

impl MigrationError {
    /// 取回未被恢复的 fiber
    pub fn into_fiber(self) -> Fiber {
        self.fiber
    }

    /// fiber 最近运行所在的线程
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn caller(&self) -> ThreadId {
        self.caller
    }

    /// 对应的协议违规种类
    pub fn violation(&self) -> Violation {
        Violation::NotMigratable
    }
}

/// Fiber 的创建选项
pub struct FiberBuilder {
    salloc: Box<dyn StackAllocator + Send>,
    palloc: Option<Preallocated>,
    migratable: bool,
}

impl FiberBuilder {
    pub fn new() -> Self {
        Self {
            salloc: Box::new(ProtectedFixedSizeStack::default()),
            palloc: None,
            migratable: false,
        }
    }

    pub fn stack<S: StackAllocator + Send + 'static>(mut self, salloc: S) -> Self {
        self.salloc = Box::new(salloc);
        self
    }

    /// 使用预分配区域，销毁时栈块交还给 `stack` 指定的分配器
    pub fn preallocated(mut self, palloc: Preallocated) -> Self {
        self.palloc = Some(palloc);
        self
    }

    /// 启动后仍允许在其它线程上恢复
    ///
    /// # Safety
    /// fiber 挂起时，其栈上不能持有 `!Send` 的状态（`Rc`、线程局部数据的引用等），
    /// 否则在其它线程上恢复后会与原线程产生数据竞争。
    ///
    /// ```compile_fail
    /// let _ = stackctx::Fiber::builder().migratable(true);
    /// ```
    pub unsafe fn migratable(mut self, migratable: bool) -> Self {
        self.migratable = migratable;
        self
    }

    pub fn spawn<F>(self, f: F) -> Result<Fiber, ContextError>
    where
        F: FnOnce(Fiber) -> Fiber + Send + 'static,
    {
        let entry = Box::new(move |c: Continuation| f(Fiber { inner: c }).inner);
        let salloc: Box<dyn StackAllocator> = self.salloc;
        Continuation::spawn(self.palloc, salloc, entry, self.migratable)
            .map(|inner| Fiber { inner })
    }
}

impl Default for FiberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Fiber {
    /// 使用默认的带保护页栈创建 fiber
    pub fn new<F>(f: F) -> Result<Self, ContextError>
    where
        F: FnOnce(Fiber) -> Fiber + Send + 'static,
    {
        FiberBuilder::new().spawn(f)
    }

    pub fn with_stack<S, F>(salloc: S, f: F) -> Result<Self, ContextError>
    where
        S: StackAllocator + Send + 'static,
        F: FnOnce(Fiber) -> Fiber + Send + 'static,
    {
        FiberBuilder::new().stack(salloc).spawn(f)
    }

    pub fn with_preallocated<S, F>(
        palloc: Preallocated,
        salloc: S,
        f: F,
    ) -> Result<Self, ContextError>
    where
        S: StackAllocator + Send + 'static,
        F: FnOnce(Fiber) -> Fiber + Send + 'static,
    {
        FiberBuilder::new().stack(salloc).preallocated(palloc).spawn(f)
    }

    pub fn builder() -> FiberBuilder {
        FiberBuilder::new()
    }

    pub fn resume(self) -> Result<Fiber, MigrationError> {
        self.resume_inner(None, None)
    }

    pub fn resume_with_data<T: Any + Send>(self, data: T) -> Result<Fiber, MigrationError> {
        self.resume_inner(Some(Box::new(data)), None)
    }

    /// 切换过去，并在目标栈上执行 `f`，语义同 `Continuation::resume_with`
    pub fn resume_with<F>(self, f: F) -> Result<Fiber, MigrationError>
    where
        F: FnOnce(Fiber) -> Fiber + Send + 'static,
    {
        self.resume_inner(
            None,
            Some(Box::new(move |c: Continuation| f(Fiber { inner: c }).inner)),
        )
    }

    pub fn resume_ontop_with_data<T, F>(self, data: T, f: F) -> Result<Fiber, MigrationError>
    where
        T: Any + Send,
        F: FnOnce(Fiber) -> Fiber + Send + 'static,
    {
        self.resume_inner(
            Some(Box::new(data)),
            Some(Box::new(move |c: Continuation| f(Fiber { inner: c }).inner)),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_resumable(&self) -> bool {
        self.inner.is_resumable()
    }

    pub fn data_available(&self) -> bool {
        self.inner.data_available()
    }

    pub fn id(&self) -> Option<usize> {
        self.inner.id()
    }

    pub fn can_resume(&self) -> bool {
        self.inner.can_resume()
    }

    pub fn can_resume_from_any_thread(&self) -> bool {
        self.inner.can_resume_from_any_thread()
    }

    #[track_caller]
    pub fn get_data<T: Any>(&mut self) -> T {
        self.inner.get_data()
    }

    pub fn try_get_data<T: Any>(&mut self) -> Result<T, ContextError> {
        self.inner.try_get_data()
    }

    pub fn with_data<T: Any + Send>(self, data: T) -> Self {
        Self {
            inner: self.inner.with_data(data),
        }
    }

    fn resume_inner(
        self,
        data: Option<Box<dyn Any + Send>>,
        ontop: Option<Box<dyn FnOnce(Continuation) -> Continuation>>,
    ) -> Result<Fiber, MigrationError> {
        match self.inner.try_resume_inner(data, ontop) {
            Ok(inner) => Ok(Fiber { inner }),
            Err((Violation::NotMigratable, inner)) => {
                let owner = inner
                    .raw()
                    // SAFETY: 句柄存在期间记录不会被销毁
                    .map(|r| unsafe { r.as_ref() }.owner())
                    .unwrap_or_else(|| thread::current().id());
                let caller = thread::current().id();
                log::debug!(
                    "[fiber] refusing to resume fiber {:?} owned by {:?} on {:?}",
                    inner.id(),
                    owner,
                    caller
                );
                Err(MigrationError {
                    fiber: Fiber { inner },
                    owner,
                    caller,
                })
            }
            Err((kind, inner)) => {
                std::mem::forget(inner);
                violation(kind)
            }
        }
    }
}

impl Default for Fiber {
    /// 空句柄
    fn default() -> Self {
        Self {
            inner: Continuation::default(),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("data_available", &self.data_available())
            .finish()
    }
}
