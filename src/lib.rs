//! 有栈执行上下文切换库
//!
//! # Overview
//! 本库允许程序创建额外的原生调用栈，把控制权转移过去，再挂起回来，
//! 在切换时携带类型化的数据，并在句柄销毁时安全地展开（unwind）挂起的栈。
//! 不依赖调度器、线程或操作系统的配合，是有栈协程、生成器与协作式 fiber 的基础。
//!
//! # Design
//! - `hal`：底层切换原语，按 cargo feature 在编译期选择唯一实现（`fcontext` 汇编 / `ucontext`）。
//! - `stack`：带保护页的栈内存分配器。
//! - `context`：活动记录（控制块）、每线程的 `Processor` 以及记录 ID 分配。
//! - `Continuation` / `Fiber`：面向用户的只可移动句柄。
//! - `unwind`：强制展开信号与 ontop 异常包装。
//!
//! # Invariants
//! - 每个 OS 线程任意时刻只有一个“当前”活动记录。
//! - 一个未终止的活动记录至多被一个存活句柄引用。
//! - 栈内存只会在其它栈上、且在其记录终止后释放。
//!
//! # Example
//! ```
//! use stackctx::Continuation;
//!
//! let mut c = Continuation::new(|mut c| {
//!     let (mut a, mut b) = (0u64, 1u64);
//!     loop {
//!         c = c.resume_with_data(a);
//!         let next = a + b;
//!         a = b;
//!         b = next;
//!     }
//! })
//! .unwrap();
//!
//! let mut seen = Vec::new();
//! for _ in 0..5 {
//!     c = c.resume();
//!     seen.push(c.get_data::<u64>());
//! }
//! assert_eq!(seen, [0, 1, 1, 2, 3]);
//! ```

mod config;
mod context;
mod continuation;
mod error;
mod fiber;
mod hal;
mod stack;
mod sync;
mod unwind;

pub use config::StackTraits;
pub use context::current_id;
pub use continuation::{callcc, Continuation};
pub use error::{ContextError, Violation};
pub use fiber::{Fiber, FiberBuilder, MigrationError};
pub use stack::{
    FixedSizeStack, PooledFixedSizeStack, Preallocated, ProtectedFixedSizeStack, StackAllocator,
    StackBlock,
};
pub use unwind::{is_forced_unwind, ForcedUnwind, OntopError};
