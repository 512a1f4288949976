//! 活动记录（控制块）模块
//!
//! # Overview
//! 每个执行上下文对应一个 `ActivationRecord`。它保存挂起时的状态令牌、
//! 生命周期标志、待执行的 ontop 闭包以及栈内存的所有权。
//!
//! # Design
//! - 普通记录直接放在自己栈的顶端，销毁时先取出栈的所有权再释放内存。
//! - 每个线程的原生栈有一个 origin record，由 `Processor` 持有，不拥有栈。
//! - 记录在创建时做一次“预热”切换：新栈先跑到 `context_entry`，
//!   登记好自己的位置后立即切回，这样所有记录都以同样的方式被恢复。
//! - 切换时在源栈上构造一个 `Packet`，以指针形式随 `Transfer::data` 传给目标，
//!   目标在 `arrive` 中取走内容。
//!
//! # Safety
//! - 终止记录的栈只会在另一个栈上、由被切换到的一方释放。
//! - `Packet` 位于源栈上，必须在释放源栈之前读完。
//!
//! # Invariants
//! - 挂起的记录 `state` 非空；正在运行的记录 `state` 为空。
//! - 设置 `TERMINATED` 之后，记录不再被恢复，只等待销毁。

use std::any::Any;
use std::cell::Cell;
use std::mem::{self, ManuallyDrop};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::thread::ThreadId;

use bitflags::bitflags;

use super::id::{id_alloc, RecordId};
use super::processor;
use crate::config::{CONTROL_BLOCK_GAP, STACK_ALIGN};
use crate::continuation::Continuation;
use crate::error::{fatal, ContextError, Violation};
use crate::hal::{self, StatePtr, Transfer};
use crate::stack::{Preallocated, StackAllocator, StackBlock};
use crate::unwind;

bitflags! {
    /// 活动记录的生命周期标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        /// 线程原生栈
        const ORIGIN = 1 << 0;
        /// 已经执行过入口函数
        const STARTED = 1 << 1;
        const TERMINATED = 1 << 2;
        /// 下次恢复时强制展开
        const UNWIND_REQUESTED = 1 << 3;
        /// 启动后仍允许在其它线程恢复
        const MIGRATABLE = 1 << 4;
    }
}

/// 上下文函数与 ontop 闭包的统一形式
pub(crate) type ContextFn = Box<dyn FnOnce(Continuation) -> Continuation>;

/// 切换时随数据一起传递的载荷
pub(crate) type Payload = Box<dyn Any + Send>;

/// 切换包，位于源栈上
pub(crate) struct Packet {
    pub from: *const ActivationRecord,
    pub data: Option<Payload>,
    /// 需要在目标栈上重新抛出的 panic
    pub panic: Option<Payload>,
}

/// `arrive` 的结果
pub(crate) struct Arrival {
    /// 切换过来的一方；已终止时为 `None`
    pub from: Option<NonNull<ActivationRecord>>,
    pub data: Option<Payload>,
    pub panic: Option<Payload>,
}

/// 栈内存及其分配器
struct StackOwner {
    block: Option<StackBlock>,
    allocator: Box<dyn StackAllocator>,
}

impl Drop for StackOwner {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.deallocate(block);
        }
    }
}

/// 活动记录
pub(crate) struct ActivationRecord {
    id: RecordId,
    /// 挂起时的状态令牌
    state: Cell<StatePtr>,
    flags: Cell<RecordFlags>,
    /// 最近一次切换到本记录的记录
    resumed_from: Cell<*const ActivationRecord>,
    /// 下次恢复时、返回用户代码之前执行的闭包
    ontop: Cell<Option<ContextFn>>,
    entry: Cell<Option<ContextFn>>,
    /// 最近一次运行所在的线程
    owner: Cell<ThreadId>,
    /// 正在执行的 ontop 闭包的来源记录
    ontop_origin: Cell<*const ActivationRecord>,
    /// ontop 闭包 panic 时其参数句柄已被释放，来源记录可以找回
    ontop_released: Cell<bool>,
    stack: ManuallyDrop<Option<StackOwner>>,
}

impl ActivationRecord {
    /// 构造线程原生栈对应的记录
    pub(crate) fn origin(thread: ThreadId) -> Self {
        Self {
            id: id_alloc(),
            state: Cell::new(ptr::null_mut()),
            flags: Cell::new(RecordFlags::ORIGIN | RecordFlags::STARTED),
            resumed_from: Cell::new(ptr::null()),
            ontop: Cell::new(None),
            entry: Cell::new(None),
            owner: Cell::new(thread),
            ontop_origin: Cell::new(ptr::null()),
            ontop_released: Cell::new(false),
            stack: ManuallyDrop::new(None),
        }
    }

    /// 在一块新栈上创建记录
    ///
    /// # Arguments
    /// - `palloc`：预分配区域；为 `None` 时由 `salloc` 分配一块新栈
    /// - `salloc`：栈分配器，记录销毁时用它归还栈
    /// - `entry`：上下文函数，第一次恢复时执行
    ///
    /// # Returns
    /// 挂起在入口处、尚未启动的记录
    pub(crate) fn create(
        palloc: Option<Preallocated>,
        salloc: Box<dyn StackAllocator>,
        entry: ContextFn,
        migratable: bool,
    ) -> Result<NonNull<Self>, ContextError> {
        let (sp, block) = match palloc {
            Some(Preallocated { sp, block }) => (sp, block),
            None => {
                let block = salloc.allocate()?;
                (block.top() as usize, block)
            }
        };
        let limit = block.limit();

        let rec_addr =
            (sp - mem::size_of::<Self>()) & !(mem::align_of::<Self>().max(STACK_ALIGN) - 1);
        let ctx_top = (rec_addr - CONTROL_BLOCK_GAP) & !(STACK_ALIGN - 1);
        debug_assert!(ctx_top > limit);

        let mut flags = RecordFlags::empty();
        if migratable {
            flags |= RecordFlags::MIGRATABLE;
        }

        let record = rec_addr as *mut Self;
        // SAFETY: [limit, sp) 是刚取得所有权的可写栈内存，控制块位于其顶端
        unsafe {
            record.write(Self {
                id: id_alloc(),
                state: Cell::new(ptr::null_mut()),
                flags: Cell::new(flags),
                resumed_from: Cell::new(ptr::null()),
                ontop: Cell::new(None),
                entry: Cell::new(Some(entry)),
                owner: Cell::new(processor::thread_id()),
                ontop_origin: Cell::new(ptr::null()),
                ontop_released: Cell::new(false),
                stack: ManuallyDrop::new(Some(StackOwner {
                    block: Some(block),
                    allocator: salloc,
                })),
            });
            let state = hal::make_context(ctx_top, ctx_top - limit, context_entry);
            // 预热：新栈登记后立即切回，返回挂起在入口处的令牌
            let t = hal::jump_context(state, record as usize);
            (*record).state.set(t.from);
        }
        log::trace!(
            "[record] created record {} on stack {:#x}..{:#x}",
            // SAFETY: 刚初始化完成
            unsafe { (*record).id() },
            limit,
            sp
        );
        // SAFETY: rec_addr 来自非空的栈地址
        Ok(unsafe { NonNull::new_unchecked(record) })
    }

    pub(crate) fn id(&self) -> usize {
        self.id.0
    }

    pub(crate) fn flags(&self) -> RecordFlags {
        self.flags.get()
    }

    fn insert_flags(&self, flags: RecordFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    pub(crate) fn is_origin(&self) -> bool {
        self.flags().contains(RecordFlags::ORIGIN)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.flags().contains(RecordFlags::TERMINATED)
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner.get()
    }

    /// 是否可以在任意线程上恢复
    pub(crate) fn can_resume_from_any_thread(&self) -> bool {
        let flags = self.flags();
        !flags.intersects(RecordFlags::ORIGIN | RecordFlags::TERMINATED)
            && (!flags.contains(RecordFlags::STARTED) || flags.contains(RecordFlags::MIGRATABLE))
    }

    /// 是否可以在当前线程上恢复
    pub(crate) fn can_resume(&self) -> bool {
        check_resumable(self).is_ok()
    }

    pub(crate) fn set_ontop(&self, f: ContextFn) {
        self.ontop.set(Some(f));
    }

    pub(crate) fn take_ontop(&self) -> Option<ContextFn> {
        self.ontop.take()
    }

    pub(crate) fn request_unwind(&self) {
        self.insert_flags(RecordFlags::UNWIND_REQUESTED);
    }

    pub(crate) fn take_unwind_request(&self) -> bool {
        let flags = self.flags();
        self.flags.set(flags - RecordFlags::UNWIND_REQUESTED);
        flags.contains(RecordFlags::UNWIND_REQUESTED)
    }

    /// 开始执行来自 `origin` 的 ontop 闭包，返回之前的登记以便嵌套恢复
    pub(crate) fn arm_ontop(&self, origin: *const Self) -> (*const Self, bool) {
        (
            self.ontop_origin.replace(origin),
            self.ontop_released.replace(false),
        )
    }

    /// 结束 ontop 闭包，返回参数句柄是否在 panic 中被释放
    pub(crate) fn disarm_ontop(&self, previous: (*const Self, bool)) -> bool {
        self.ontop_origin.set(previous.0);
        self.ontop_released.replace(previous.1)
    }

    /// panic 期间释放指向 `target` 的句柄时调用
    ///
    /// `target` 是正在执行的 ontop 闭包的来源时记下释放并返回 `true`，
    /// 调用方不应再展开 `target`。
    pub(crate) fn release_ontop_origin(&self, target: *const Self) -> bool {
        if !target.is_null() && ptr::eq(self.ontop_origin.get(), target) {
            self.ontop_released.set(true);
            return true;
        }
        false
    }
}

/// 检查 `target` 是否可以在当前线程上恢复
pub(crate) fn check_resumable(target: &ActivationRecord) -> Result<(), Violation> {
    if target.is_terminated() {
        return Err(Violation::Terminated);
    }
    if ptr::eq(target, processor::current()) {
        return Err(Violation::AlreadyRunning);
    }
    if target.owner() != processor::thread_id() && !target.can_resume_from_any_thread() {
        return Err(Violation::NotMigratable);
    }
    Ok(())
}

/// 切换到 `target`，返回以后切换回来时的 `Transfer`
///
/// # Safety
/// - `target` 必须挂起且已通过 `check_resumable`
/// - `packet.from` 必须是当前记录
pub(crate) unsafe fn transfer(target: NonNull<ActivationRecord>, mut packet: Packet) -> Transfer {
    let to = target.as_ref();
    let state = to.state.replace(ptr::null_mut());
    debug_assert!(!state.is_null());
    to.resumed_from.set(packet.from);
    processor::set_current(target.as_ptr());
    hal::jump_context(state, &mut packet as *mut Packet as usize)
}

/// 被切换到之后，在当前栈上处理切换包
///
/// 记下源记录的状态令牌；源记录已终止时在这里销毁它。
///
/// # Safety
/// - `t` 必须来自 `transfer`
pub(crate) unsafe fn arrive(t: Transfer) -> Arrival {
    let packet = &mut *(t.data as *mut Packet);
    let source = packet.from as *mut ActivationRecord;
    let data = packet.data.take();
    let panic = packet.panic.take();

    let me = &*processor::current();
    debug_assert!(ptr::eq(me.resumed_from.get(), source));
    me.owner.set(processor::thread_id());
    me.insert_flags(RecordFlags::STARTED);

    let from = if (*source).is_terminated() {
        destroy(source);
        None
    } else {
        (*source).state.set(t.from);
        Some(NonNull::new_unchecked(source))
    };
    Arrival { from, data, panic }
}

/// 销毁已终止的记录并归还其栈
///
/// # Safety
/// - `record` 已终止且不是当前记录
unsafe fn destroy(record: *mut ActivationRecord) {
    log::trace!("[record] destroy record {}", (*record).id());
    let stack = ManuallyDrop::take(&mut (*record).stack);
    ptr::drop_in_place(record);
    // 控制块就在这块栈上，必须最后释放
    drop(stack);
}

/// 新栈的第一个函数
extern "C" fn context_entry(t: Transfer) -> ! {
    let record = t.data as *mut ActivationRecord;
    // SAFETY: 预热切换的 from 是创建者，它正等待这次返回
    let t = unsafe { hal::jump_context(t.from, 0) };
    // SAFETY: 第一次真正恢复，t 来自 transfer
    unsafe { run(record, t) }
}

/// 执行上下文函数，结束后切换到其返回的句柄
unsafe fn run(record: *mut ActivationRecord, t: Transfer) -> ! {
    let rec = &*record;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let from = Continuation::land(t);
        match rec.entry.take() {
            Some(entry) => entry(from),
            None => fatal(Violation::Terminated),
        }
    }));
    let (next, resurface) = match outcome {
        Ok(next) => (next, None),
        Err(payload) => unwind::exit_target(payload),
    };

    // 未启动就被展开时，入口闭包仍在记录中
    let leftover = rec.entry.take();
    if leftover.is_some() {
        let _ = panic::catch_unwind(AssertUnwindSafe(move || drop(leftover)));
    }
    exit(record, next, resurface)
}

/// 终止记录并切换到 `next`，不会返回
unsafe fn exit(record: *mut ActivationRecord, next: Continuation, panic: Option<Payload>) -> ! {
    let rec = &*record;
    let (target, data) = next.into_parts();
    let target = match target {
        Some(target) => target,
        None => fatal(Violation::EmptyReturn),
    };
    if let Err(kind) = check_resumable(target.as_ref()) {
        fatal(kind);
    }
    let ontop = rec.ontop.take();
    if ontop.is_some() {
        let _ = panic::catch_unwind(AssertUnwindSafe(move || drop(ontop)));
    }

    rec.insert_flags(RecordFlags::TERMINATED);
    rec.resumed_from.set(ptr::null());
    log::trace!(
        "[record] record {} terminated, switching to record {}",
        rec.id(),
        target.as_ref().id()
    );
    transfer(
        target,
        Packet {
            from: record,
            data,
            panic,
        },
    );
    // 终止的记录不会再被恢复
    fatal(Violation::Terminated)
}
