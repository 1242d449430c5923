//! Diagnostic call trail
//!
//! Every entry point and the layers below it push a static frame name while
//! they run. Errors copy the stack when they are built so the boundary can log
//! where a failure happened; the snapshot never reaches the caller.

use std::cell::RefCell;
use std::marker::PhantomData;

thread_local! {
    static TRAIL: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
}

/// Scope guard returned by [`enter`], popping its frame when dropped
#[derive(Debug)]
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct Frame {
    // frames belong to the thread that pushed them
    _not_send: PhantomData<*const ()>,
}

/// Push `name` onto the current thread's trail
pub fn enter(name: &'static str) -> Frame {
    TRAIL.with_borrow_mut(|trail| trail.push(name));
    Frame {
        _not_send: PhantomData,
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        TRAIL.with_borrow_mut(|trail| {
            trail.pop();
        });
    }
}

/// Current trail, innermost frame first
pub fn snapshot() -> Vec<&'static str> {
    TRAIL.with_borrow(|trail| trail.iter().rev().copied().collect())
}

/// Render a snapshot for log output
pub fn render(trail: &[&'static str]) -> String {
    trail.join(" <- ")
}
