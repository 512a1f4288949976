//! 活动记录 ID 分配
//!
//! ID 只用于日志与诊断。记录销毁时归还，之后优先复用最小的空闲 ID，
//! 这样长时间运行后日志里的 ID 仍然保持较小。

use std::collections::BTreeSet;

use lazy_static::lazy_static;

use crate::sync::ExclusiveCell;

lazy_static! {
    static ref RECORD_IDS: ExclusiveCell<IdPool> = ExclusiveCell::new(IdPool::new());
}

/// 持有一个记录 ID，销毁时归还
pub(crate) struct RecordId(pub usize);

pub(crate) fn id_alloc() -> RecordId {
    RecordId(RECORD_IDS.exclusive_session(IdPool::take))
}

impl Drop for RecordId {
    fn drop(&mut self) {
        RECORD_IDS.exclusive_session(|pool| pool.give_back(self.0));
    }
}

struct IdPool {
    /// 从未分配过的最小 ID
    next: usize,
    free: BTreeSet<usize>,
}

impl IdPool {
    fn new() -> Self {
        Self {
            next: 0,
            free: BTreeSet::new(),
        }
    }

    fn take(&mut self) -> usize {
        match self.free.pop_first() {
            Some(id) => id,
            None => {
                self.next += 1;
                self.next - 1
            }
        }
    }

    fn give_back(&mut self, id: usize) {
        if id >= self.next || !self.free.insert(id) {
            log::error!("[record_id] id {} released twice or never allocated", id);
            return;
        }
        // 归还的是最大的 ID 时收缩上界
        while self.next > 0 && self.free.remove(&(self.next - 1)) {
            self.next -= 1;
        }
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        self.next - self.free.len()
    }
}
