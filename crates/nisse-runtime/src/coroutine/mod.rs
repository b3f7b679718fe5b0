//! # Stackful coroutines
//!
//! A `Coroutine<Y>` runs a closure on its own mmap'd stack and can suspend
//! in the middle of any call by handing one `Y` value back to whoever called
//! [`Coroutine::resume`]. The transfer is symmetric: `resume()` switches
//! into the coroutine, [`Yielder::suspend`] switches back out, and each side
//! continues exactly where it left off.
//!
//! The coroutine is `Send`. Consecutive resumes may happen on different
//! threads; the caller guarantees they never overlap (the server enforces
//! this with its one-armed-interest-per-connection rule).
//!
//! Dropping a suspended coroutine releases its stack without unwinding it:
//! destructors of frames alive at the suspension point do not run. Bodies
//! that own cleanup-sensitive resources should either run to completion or
//! keep those resources outside the coroutine.

mod arch;
mod stack;

pub use stack::DEFAULT_STACK_SIZE;

use arch::{init_context, switch_context, Context};
use stack::CoroStack;

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CoroState {
    /// Created, body not entered yet.
    New,
    /// A resume is in flight.
    Running,
    /// Parked inside `Yielder::suspend`.
    Suspended,
    /// The body returned; the coroutine will never run again.
    Finished,
}

/// Heap-pinned coroutine state. Both the resumer and the running body reach
/// this through raw pointers, which is why it must never move after
/// `init_context` captured its address.
struct CoroInner<Y> {
    stack: CoroStack,
    /// Frame of the thread that called `resume()`.
    caller: Context,
    /// Frame of the coroutine itself.
    coro: Context,
    state: CoroState,
    /// Value published by the most recent `suspend`.
    yielded: Option<Y>,
    /// Body closure; taken on first entry.
    entry: Option<Box<dyn FnOnce(&Yielder<Y>) + Send + 'static>>,
}

/// A stackful coroutine yielding values of type `Y`.
pub struct Coroutine<Y> {
    inner: Box<CoroInner<Y>>,
}

/// Handle the body uses to suspend. Clones share the same coroutine; the
/// server clones one into each would-block hook of a connection's stream.
pub struct Yielder<Y> {
    inner: *mut CoroInner<Y>,
}

impl<Y> Clone for Yielder<Y> {
    fn clone(&self) -> Self {
        Self { inner: self.inner }
    }
}

// A Yielder is only ever dereferenced from inside the running body, which a
// single thread executes at a time. Moving the handle between threads (as
// part of the coroutine's own state) is therefore fine.
unsafe impl<Y: Send> Send for Yielder<Y> {}

impl<Y> Coroutine<Y> {
    /// Create a coroutine with `stack_size` usable stack bytes. The body
    /// does not run until the first [`resume`](Self::resume).
    pub fn new<F>(stack_size: usize, body: F) -> io::Result<Self>
    where
        F: FnOnce(&Yielder<Y>) + Send + 'static,
    {
        let mut inner = Box::new(CoroInner {
            stack: CoroStack::new(stack_size)?,
            caller: Context::default(),
            coro: Context::default(),
            state: CoroState::New,
            yielded: None,
            entry: Some(Box::new(body)),
        });

        let stack_top = inner.stack.top();
        let arg = &mut *inner as *mut CoroInner<Y> as usize;
        unsafe {
            init_context(&mut inner.coro, stack_top, coro_entry::<Y> as usize, arg);
        }

        Ok(Self { inner })
    }

    /// Run the body until it suspends or returns.
    ///
    /// Returns the suspended value, or `None` once the body has returned.
    /// Resuming a finished coroutine stays `None`.
    ///
    /// # Panics
    ///
    /// Panics if called re-entrantly while the body is running.
    pub fn resume(&mut self) -> Option<Y> {
        let inner: *mut CoroInner<Y> = &mut *self.inner;
        unsafe {
            match (*inner).state {
                CoroState::Finished => return None,
                CoroState::Running => panic!("coroutine resumed while running"),
                CoroState::New | CoroState::Suspended => {}
            }
            (*inner).state = CoroState::Running;
            switch_context(&mut (*inner).caller, &(*inner).coro);
            (*inner).yielded.take()
        }
    }

    /// Whether the body has returned.
    pub fn is_finished(&self) -> bool {
        self.inner.state == CoroState::Finished
    }
}

impl<Y> Yielder<Y> {
    /// Publish `value` and transfer control back to the resumer. Returns
    /// when the coroutine is next resumed.
    pub fn suspend(&self, value: Y) {
        unsafe {
            debug_assert_eq!((*self.inner).state, CoroState::Running);
            (*self.inner).yielded = Some(value);
            (*self.inner).state = CoroState::Suspended;
            switch_context(&mut (*self.inner).coro, &(*self.inner).caller);
        }
    }
}

/// Entry point executed on the coroutine stack. Runs the body, marks the
/// coroutine finished and switches back to the resumer for the last time.
///
/// A panic must not unwind past this frame (below it sits the bare entry
/// trampoline, not a caller), so the body runs under `catch_unwind` and a
/// panicking coroutine simply finishes.
extern "C" fn coro_entry<Y>(inner: *mut CoroInner<Y>) {
    unsafe {
        let body = (*inner).entry.take().expect("coroutine entered twice");
        let yielder = Yielder { inner };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| body(&yielder))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(target: "nisse::coroutine", %message, "coroutine body panicked");
        }
        (*inner).state = CoroState::Finished;
        switch_context(&mut (*inner).coro, &(*inner).caller);
    }
    unreachable!("finished coroutine resumed");
}
