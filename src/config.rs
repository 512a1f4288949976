//! 栈大小相关常量与平台栈特性
//!
//! 这些常量用于栈分配、控制块布局以及栈回收池。
//! 所有大小都以字节为单位，部分使用页面（4KB）为单位。
//! 运行期才能确定的值（页大小、`RLIMIT_STACK`）由 `StackTraits` 在第一次使用时读取并缓存。

use lazy_static::lazy_static;

/// 无法从系统读取时使用的页大小，4KB
pub const FALLBACK_PAGE_SIZE: usize = 0x1000;

/// 默认栈大小，256KB
/// 需要容纳用户代码以及 panic 展开机制自身消耗的栈
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// 最小栈大小，16KB（不含保护页）
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// 控制块与初始上下文之间预留的字节数
pub const CONTROL_BLOCK_GAP: usize = 64;

/// 栈顶对齐要求，所有支持的架构都要求 16 字节
pub const STACK_ALIGN: usize = 16;

/// 回收池默认最多缓存的栈块数量
pub const POOL_CAPACITY: usize = 64;

lazy_static! {
    /// 进程级栈特性缓存
    ///
    /// 页大小和资源限制在进程生命周期内视为不变，只读取一次。
    static ref TRAITS: Limits = Limits::query();
}

struct Limits {
    page_size: usize,
    /// `None` 表示无上限
    maximum: Option<usize>,
}

impl Limits {
    fn query() -> Self {
        // SAFETY: sysconf / getrlimit 只读取进程信息，不修改任何状态
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => FALLBACK_PAGE_SIZE,
        };
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let maximum = if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) } == 0
            && limit.rlim_max != libc::RLIM_INFINITY
        {
            Some(limit.rlim_max as usize)
        } else {
            None
        };
        log::trace!(
            "[stack_traits] page size {:#x}, maximum {:?}",
            page_size,
            maximum
        );
        Self { page_size, maximum }
    }
}

/// 平台相关的栈大小约束
///
/// 所有分配器都以此为准校验请求的栈大小。
#[derive(Debug, Clone, Copy)]
pub struct StackTraits;

impl StackTraits {
    /// 系统页大小
    pub fn page_size() -> usize {
        TRAITS.page_size
    }

    /// 栈大小是否不受系统资源限制
    pub fn is_unbounded() -> bool {
        TRAITS.maximum.is_none()
    }

    /// 默认栈大小，受最大值约束
    pub fn default_size() -> usize {
        match Self::maximum_size() {
            Some(max) => DEFAULT_STACK_SIZE.min(max),
            None => DEFAULT_STACK_SIZE,
        }
    }

    /// 最小栈大小
    pub fn minimum_size() -> usize {
        MIN_STACK_SIZE
    }

    /// 最大栈大小，`None` 表示无上限
    pub fn maximum_size() -> Option<usize> {
        TRAITS.maximum
    }

    /// 把大小向上取整到页边界
    pub(crate) fn round_to_page(size: usize) -> usize {
        let page = Self::page_size();
        (size + page - 1) & !(page - 1)
    }
}
