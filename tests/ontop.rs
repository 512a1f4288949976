use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use stackctx::{callcc, is_forced_unwind, Continuation, OntopError};

#[test]
fn test_ontop_runs_before_target_continues() {
    let i = Rc::new(Cell::new(3));
    let shared = i.clone();
    let c = callcc(move |mut c| loop {
        shared.set(shared.get() * 10);
        c = c.resume();
    })
    .unwrap();
    assert_eq!(i.get(), 30);

    let shared = i.clone();
    let c = c.resume_with(move |c| {
        shared.set(shared.get() - 10);
        c
    });
    assert!(c.is_resumable());
    assert_eq!(i.get(), 200);
}

#[test]
fn test_ontop_on_first_resume() {
    let c = Continuation::new(|mut c| {
        let v: u32 = c.get_data();
        c.with_data(v + 1)
    })
    .unwrap();
    let mut c = c.resume_with(|c| c.with_data(41u32));
    assert!(c.is_empty());
    assert_eq!(c.get_data::<u32>(), 42);
}

#[test]
fn test_ontop_transforms_data() {
    let mut c = Continuation::new(|mut c| loop {
        c = c.resume();
        let v: i32 = c.get_data();
        c = c.resume_with_data(v + 1);
    })
    .unwrap();
    c = c.resume();

    c = c.resume_ontop_with_data(5i32, |mut c| {
        let v: i32 = c.get_data();
        c.with_data(v * 2)
    });
    assert_eq!(c.get_data::<i32>(), 11);
}

#[test]
fn test_ontop_redirects_to_third_context() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let main_slot: Rc<RefCell<Option<Continuation>>> = Rc::new(RefCell::new(None));
    let a_slot: Rc<RefCell<Option<Continuation>>> = Rc::new(RefCell::new(None));

    let a_log = log.clone();
    let a = Continuation::new(move |mut c| loop {
        a_log.borrow_mut().push("a");
        c = c.resume();
    })
    .unwrap();
    let a = a.resume();

    let (b_log, b_main, b_a) = (log.clone(), main_slot.clone(), a_slot.clone());
    let b = Continuation::new(move |from_a| {
        b_log.borrow_mut().push("b");
        *b_a.borrow_mut() = Some(from_a);
        b_main.borrow_mut().take().unwrap()
    })
    .unwrap();

    // a 的挂起点返回的是 b 而不是 main
    let stash = main_slot.clone();
    let rest = a.resume_with(move |main| {
        *stash.borrow_mut() = Some(main);
        b
    });
    assert!(rest.is_empty());
    assert_eq!(*log.borrow(), ["a", "a", "b"]);

    let a = a_slot.borrow_mut().take().unwrap();
    assert!(a.is_resumable());
    drop(a);
}

#[test]
fn test_injected_panic_caught_by_target() {
    let caught = Rc::new(RefCell::new(String::new()));
    let slot = caught.clone();
    let c = callcc(move |c| {
        let mut c = Some(c);
        loop {
            let current = c.take().unwrap();
            match panic::catch_unwind(AssertUnwindSafe(move || current.resume())) {
                Ok(next) => c = Some(next),
                Err(payload) => {
                    if is_forced_unwind(&*payload) {
                        panic::resume_unwind(payload);
                    }
                    let mut err = payload.downcast::<OntopError>().unwrap();
                    let message = err.payload().downcast_ref::<&str>().unwrap();
                    *slot.borrow_mut() = message.to_string();
                    c = err.take_origin();
                }
            }
        }
    })
    .unwrap();

    let c = c.resume_with(|_c| -> Continuation { panic!("injected") });
    assert!(c.is_resumable());
    assert_eq!(*caught.borrow(), "injected");
    drop(c);
}

#[test]
fn test_injected_panic_resurfaces_at_caller() {
    let c = Continuation::new(|c| c.resume()).unwrap();
    let c = c.resume();

    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        c.resume_with(|_c| -> Continuation { panic!("boom") })
    }));
    let err = result.unwrap_err().downcast::<OntopError>().unwrap();
    assert_eq!(*err.into_inner().downcast::<&str>().unwrap(), "boom");
}
