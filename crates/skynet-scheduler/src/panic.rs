//! The run boundary: converts a panicking job procedure into a [`RunError`].

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{AssertUnwindSafe, PanicHookInfo};
use std::sync::Once;

use futures_util::future::poll_fn;
use futures_util::FutureExt;

use crate::error::{BoxError, RunError};

struct PanicSite {
    location: String,
    backtrace: String,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
    /// Set while this thread polls a guarded job future.
    static IN_RUN: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as polling a job until dropped.
struct RunScope {
    outer: bool,
}

impl RunScope {
    fn enter() -> Self {
        Self {
            outer: IN_RUN.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        IN_RUN.with(|flag| flag.set(self.outer));
    }
}

static HOOK: Once = Once::new();

/// Chain a process panic hook that remembers where the current thread
/// panicked. The payload alone carries neither location nor stack.
fn install_hook() {
    HOOK.call_once(|| {
        let previous_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
            if IN_RUN.with(Cell::get) {
                record_site(info);
            }
            previous_hook(info);
        }));
    });
}

fn record_site(info: &PanicHookInfo<'_>) {
    let location = info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let backtrace = Backtrace::force_capture().to_string();
    LAST_PANIC.with(|slot| {
        *slot.borrow_mut() = Some(PanicSite {
            location,
            backtrace,
        })
    });
}

/// Drive one attempt of a job procedure, turning a panic into
/// [`RunError::Panicked`] instead of unwinding into the coordinator.
pub(crate) async fn run_guarded<F>(run: F) -> Result<(), RunError>
where
    F: Future<Output = Result<(), BoxError>>,
{
    install_hook();
    let mut run = std::pin::pin!(AssertUnwindSafe(run).catch_unwind());
    // Scoped per poll: the task may move between worker threads.
    let outcome = poll_fn(|cx| {
        let _scope = RunScope::enter();
        run.as_mut().poll(cx)
    })
    .await;
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RunError::from(e)),
        Err(payload) => {
            // The hook ran on this thread while the poll was unwinding.
            let site = LAST_PANIC.with(|slot| slot.borrow_mut().take());
            let (location, backtrace) = site
                .map(|s| (s.location, s.backtrace))
                .unwrap_or_else(|| ("<unknown>".to_string(), String::new()));
            Err(RunError::Panicked {
                message: payload_to_string(payload.as_ref()),
                location,
                backtrace,
            })
        }
    }
}

fn payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "Box<dyn Any>".to_string()
}
