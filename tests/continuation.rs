use std::cell::{Cell, RefCell};
use std::mem;
use std::panic;
use std::rc::Rc;

use stackctx::{callcc, current_id, Continuation};

#[test]
fn test_move_leaves_empty_handle() {
    let started = Rc::new(Cell::new(false));
    let flag = started.clone();
    let mut h = Continuation::new(move |c| {
        flag.set(true);
        c
    })
    .unwrap();

    let h2 = mem::take(&mut h);
    assert!(h.is_empty());
    assert!(!h.is_resumable());
    assert!(h2.is_resumable());
    assert!(!started.get());

    let done = h2.resume();
    assert!(started.get());
    assert!(done.is_empty());
}

#[test]
fn test_ping_pong_fifo() {
    const ROUNDS: u32 = 100;
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();

    let mut c = Continuation::new(move |mut c| loop {
        let v: u32 = c.get_data();
        sink.borrow_mut().push(v);
        c = c.resume_with_data(v * 10);
    })
    .unwrap();

    for i in 0..ROUNDS {
        c = c.resume_with_data(i);
        assert_eq!(c.get_data::<u32>(), i * 10);
        assert!(!c.data_available());
    }
    assert_eq!(*received.borrow(), (0..ROUNDS).collect::<Vec<_>>());
}

#[test]
fn test_immediate_return_yields_empty_handle() {
    let c = Continuation::new(|c| c).unwrap();
    let c = c.resume();
    assert!(c.is_empty());
    assert!(!c.data_available());
}

#[test]
fn test_final_payload_on_empty_handle() {
    let c = Continuation::new(|c| c.with_data(String::from("done"))).unwrap();
    let mut c = c.resume();
    assert!(c.is_empty());
    assert!(c.data_available());
    assert_eq!(c.get_data::<String>(), "done");
}

#[test]
fn test_fibonacci() {
    let mut c = Continuation::new(|mut c| {
        let (mut a, mut b) = (0u64, 1u64);
        loop {
            c = c.resume_with_data(a);
            let next = a + b;
            a = b;
            b = next;
        }
    })
    .unwrap();

    let mut seen = Vec::new();
    for _ in 0..10 {
        c = c.resume();
        seen.push(c.get_data::<u64>());
    }
    assert_eq!(seen, [0, 1, 1, 2, 3, 5, 8, 13, 21, 34]);
}

#[test]
fn test_exception_relay() {
    let message = Rc::new(RefCell::new(String::new()));
    let slot = message.clone();
    let c = Continuation::new(move |c| {
        let err = panic::catch_unwind(|| panic::panic_any(String::from("hello world")))
            .unwrap_err();
        *slot.borrow_mut() = *err.downcast::<String>().unwrap();
        c
    })
    .unwrap();

    let c = c.resume();
    assert!(c.is_empty());
    assert_eq!(*message.borrow(), "hello world");
}

#[test]
fn test_callcc_starts_immediately() {
    let i = Rc::new(Cell::new(0));
    let shared = i.clone();
    let c = callcc(move |mut c| {
        loop {
            shared.set(shared.get() + 1);
            c = c.resume();
        }
    })
    .unwrap();
    assert_eq!(i.get(), 1);
    let c = c.resume();
    assert_eq!(i.get(), 2);
    drop(c);
}

#[test]
fn test_current_id_changes_inside_context() {
    let outer = current_id();
    let c = Continuation::new(move |c| c.with_data(current_id())).unwrap();
    let inner_expected = c.id().unwrap();
    let mut c = c.resume();
    let inner = c.get_data::<usize>();
    assert_eq!(inner, inner_expected);
    assert_ne!(inner, outer);
    assert_eq!(current_id(), outer);
}

#[test]
fn test_nested_contexts() {
    let c = Continuation::new(|c| {
        let inner = Continuation::new(|c| c.with_data(2u32)).unwrap();
        let mut done = inner.resume();
        let v: u32 = done.get_data();
        c.with_data(v + 1)
    })
    .unwrap();
    let mut c = c.resume();
    assert_eq!(c.get_data::<u32>(), 3);
}

#[test]
fn test_resumed_by_sibling() {
    // a 挂起后把句柄交给 b，由 b 恢复 a
    let a = Continuation::new(|mut main| {
        main = main.resume_with_data(1u32);
        main.with_data(3u32)
    })
    .unwrap();
    let mut a = a.resume();
    assert_eq!(a.get_data::<u32>(), 1);

    let b = Continuation::new(move |main| {
        let mut rest = a.resume();
        let v: u32 = rest.get_data();
        main.with_data(v + 1)
    })
    .unwrap();
    let mut b = b.resume();
    assert!(b.is_empty());
    assert_eq!(b.get_data::<u32>(), 4);
}
