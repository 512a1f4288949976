use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use stackctx::{is_forced_unwind, Continuation};

/// 进入时加一，离开时减一
struct Scope(Rc<Cell<i32>>);

impl Scope {
    fn enter(counter: &Rc<Cell<i32>>) -> Self {
        counter.set(counter.get() + 1);
        Scope(counter.clone())
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

#[test]
fn test_drop_unwinds_suspended_stack() {
    let counter = Rc::new(Cell::new(0));
    let shared = counter.clone();
    let c = Continuation::new(move |mut c| {
        let _scope = Scope::enter(&shared);
        loop {
            c = c.resume();
        }
    })
    .unwrap();

    let c = c.resume();
    assert_eq!(counter.get(), 1);
    drop(c);
    assert_eq!(counter.get(), 0);
}

#[test]
fn test_drop_unstarted_releases_entry() {
    let counter = Rc::new(Cell::new(0));
    let ran = Rc::new(Cell::new(false));
    let scope = Scope::enter(&counter);
    let flag = ran.clone();
    let c = Continuation::new(move |c| {
        let _scope = scope;
        flag.set(true);
        c
    })
    .unwrap();

    assert_eq!(counter.get(), 1);
    drop(c);
    assert_eq!(counter.get(), 0);
    assert!(!ran.get());
}

#[test]
fn test_drop_unwinds_nested_owner() {
    let counter = Rc::new(Cell::new(0));

    let inner_counter = counter.clone();
    let inner = Continuation::new(move |mut c| {
        let _scope = Scope::enter(&inner_counter);
        loop {
            c = c.resume();
        }
    })
    .unwrap();

    let outer_counter = counter.clone();
    let outer = Continuation::new(move |mut c| {
        let _scope = Scope::enter(&outer_counter);
        // 持有 inner 的句柄，展开 outer 时连带展开 inner
        let _inner = inner.resume();
        loop {
            c = c.resume();
        }
    })
    .unwrap();

    let outer = outer.resume();
    assert_eq!(counter.get(), 2);
    drop(outer);
    assert_eq!(counter.get(), 0);
}

#[test]
fn test_forced_unwind_passes_user_catch() {
    let counter = Rc::new(Cell::new(0));
    let caught = Rc::new(Cell::new(0));
    let shared = counter.clone();
    let seen = caught.clone();
    let c = Continuation::new(move |c| {
        let _scope = Scope::enter(&shared);
        let mut c = Some(c);
        loop {
            let current = c.take().unwrap();
            match panic::catch_unwind(AssertUnwindSafe(move || current.resume())) {
                Ok(next) => c = Some(next),
                Err(payload) => {
                    seen.set(seen.get() + 1);
                    assert!(is_forced_unwind(&*payload));
                    panic::resume_unwind(payload);
                }
            }
        }
    })
    .unwrap();

    let c = c.resume();
    let c = c.resume();
    drop(c);
    assert_eq!(caught.get(), 1);
    assert_eq!(counter.get(), 0);
}

#[test]
fn test_drop_after_completion_is_noop() {
    let c = Continuation::new(|c| c).unwrap();
    let done = c.resume();
    assert!(done.is_empty());
    drop(done);
}
