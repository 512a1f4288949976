//! 独占访问单元
//!
//! # Overview
//! 提供 `ExclusiveCell`，对全局或共享的分配器状态做互斥访问，
//! 接口与 `exclusive_access` / `exclusive_session` 保持一致。
//!
//! # Design
//! - 内部使用 `std::sync::Mutex`，进程中的任意线程都可能创建或销毁活动记录。
//! - 锁被毒化（持锁时发生 panic）时仍然返回内部数据：
//!   被保护的数据只有 ID 与空闲栈列表，中断的更新不会破坏它们的一致性。
//!
//! # Invariants
//! - 持有 `exclusive_access` 返回的守卫期间不得进行上下文切换，
//!   否则另一个栈上的代码可能在同一线程上再次加锁而死锁。

use std::sync::{Mutex, MutexGuard};

pub struct ExclusiveCell<T> {
    inner: Mutex<T>,
}

impl<T> ExclusiveCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// 获取独占访问权
    pub fn exclusive_access(&self) -> MutexGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 在独占访问期间执行闭包，返回闭包结果
    pub fn exclusive_session<F, V>(&self, f: F) -> V
    where
        F: FnOnce(&mut T) -> V,
    {
        let mut inner = self.exclusive_access();
        f(&mut inner)
    }
}
