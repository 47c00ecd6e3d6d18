#![forbid(unsafe_code)]

//! Serialized execution contexts and cross-context marshaling.
//!
//! A binding spans two worlds: the host application's context and the script
//! engine's context. Each side's state is only ever touched from its own
//! [`Context`]. Cross-side work is an explicit message: a closure posted to
//! the other context's queue.
//!
//! Two implementations cover the realistic deployments:
//!
//! - [`ThreadContext`]: a dedicated named worker thread draining an mpsc
//!   queue. This models a real script-engine thread.
//! - [`DirectContext`]: a trampoline queue drained on whichever thread posts
//!   first. Tasks still run serialized and in order, but no thread is
//!   spawned. This is what tests and single-threaded embeddings use.
//!
//! # Invariants
//!
//! - Tasks posted to one context run serialized, in submission order.
//! - [`Context::is_current`] is true exactly while a task posted to that
//!   context is running on the calling thread; [`block_on`] uses it to run
//!   inline instead of deadlocking on a self-wait.
//! - A context that shuts down drops queued tasks; [`block_on`] then reports
//!   [`DispatchError::ContextGone`] instead of hanging.
//!
//! # Failure Modes
//!
//! A task that panics kills its worker thread; later posts are dropped with
//! a warning. The engine's own tasks do not panic.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// A unit of work submitted to a context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// One serialized execution context.
pub trait Context: Send + Sync {
    /// Enqueue `task`. Never blocks on task execution.
    fn post(&self, task: Task);

    /// True when the caller is already executing on this context.
    fn is_current(&self) -> bool;
}

/// Error from cross-context marshaling.
#[derive(Debug)]
pub enum DispatchError {
    /// The target context shut down before running the task.
    ContextGone,
    /// The worker thread could not be spawned.
    Spawn(std::io::Error),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextGone => write!(f, "execution context is gone"),
            Self::Spawn(e) => write!(f, "failed to spawn context worker: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ContextGone => None,
            Self::Spawn(e) => Some(e),
        }
    }
}

/// Run `f` on `ctx` and wait for its result.
///
/// Runs inline when the caller is already on `ctx`, so it is safe to call
/// from within a task on the same context.
///
/// # Errors
///
/// [`DispatchError::ContextGone`] if the context dropped the task without
/// running it.
pub fn block_on<R, F>(ctx: &dyn Context, f: F) -> Result<R, DispatchError>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    if ctx.is_current() {
        return Ok(f());
    }
    let (tx, rx) = mpsc::channel();
    ctx.post(Box::new(move || {
        let _ = tx.send(f());
    }));
    rx.recv().map_err(|_| DispatchError::ContextGone)
}

fn lock_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// DirectContext
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DirectQueue {
    tasks: VecDeque<Task>,
    drainer: Option<ThreadId>,
}

/// Trampoline context: the first poster drains the queue, re-entrant posts
/// append and return.
///
/// Serialization holds across threads: while one thread is draining, posts
/// from other threads enqueue and their tasks run on the draining thread.
#[derive(Default)]
pub struct DirectContext {
    queue: Mutex<DirectQueue>,
}

impl DirectContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Context for DirectContext {
    fn post(&self, task: Task) {
        {
            let mut q = lock_recover(&self.queue);
            q.tasks.push_back(task);
            if q.drainer.is_some() {
                // Someone is already draining; they will pick this up.
                return;
            }
            q.drainer = Some(thread::current().id());
        }
        loop {
            let task = {
                let mut q = lock_recover(&self.queue);
                match q.tasks.pop_front() {
                    Some(t) => t,
                    None => {
                        q.drainer = None;
                        return;
                    }
                }
            };
            task();
        }
    }

    fn is_current(&self) -> bool {
        lock_recover(&self.queue).drainer == Some(thread::current().id())
    }
}

impl fmt::Debug for DirectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = lock_recover(&self.queue);
        f.debug_struct("DirectContext")
            .field("queued", &q.tasks.len())
            .field("draining", &q.drainer.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ThreadContext
// ---------------------------------------------------------------------------

/// A context backed by a dedicated named worker thread.
///
/// Dropping the context closes the queue; the worker drains what was already
/// posted, then exits, and the drop joins it (unless dropped from its own
/// worker, which detaches instead).
pub struct ThreadContext {
    tx: Option<mpsc::Sender<Task>>,
    worker_id: ThreadId,
    worker: Option<thread::JoinHandle<()>>,
}

impl ThreadContext {
    /// Spawn the worker.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Spawn`] if the OS refuses the thread.
    pub fn new(name: &str) -> Result<Self, DispatchError> {
        let (tx, rx) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .map_err(DispatchError::Spawn)?;
        let worker_id = worker.thread().id();
        Ok(Self {
            tx: Some(tx),
            worker_id,
            worker: Some(worker),
        })
    }
}

impl Context for ThreadContext {
    fn post(&self, task: Task) {
        if let Some(tx) = &self.tx {
            if tx.send(task).is_err() {
                tracing::warn!("context worker is gone; task dropped");
            }
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.worker_id
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // Closing the sender lets the worker drain pending tasks and exit.
        self.tx.take();
        if thread::current().id() != self.worker_id {
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ContextPair
// ---------------------------------------------------------------------------

/// The two contexts a binding runs across.
#[derive(Clone)]
pub struct ContextPair {
    pub host: Arc<dyn Context>,
    pub script: Arc<dyn Context>,
}

impl ContextPair {
    #[must_use]
    pub fn new(host: Arc<dyn Context>, script: Arc<dyn Context>) -> Self {
        Self { host, script }
    }

    /// Two trampoline contexts. What tests and single-threaded embeddings
    /// use.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            host: Arc::new(DirectContext::new()),
            script: Arc::new(DirectContext::new()),
        }
    }

    /// Two dedicated worker threads, named `tain-host` and `tain-script`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Spawn`] if either worker cannot start.
    pub fn threaded() -> Result<Self, DispatchError> {
        Ok(Self {
            host: Arc::new(ThreadContext::new("tain-host")?),
            script: Arc::new(ThreadContext::new("tain-script")?),
        })
    }
}

impl fmt::Debug for ContextPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextPair { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── DirectContext ────────────────────────────────────────────────

    #[test]
    fn direct_runs_posted_task() {
        let ctx = DirectContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ctx.post(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn direct_reentrant_post_preserves_order() {
        let ctx = Arc::new(DirectContext::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let (c, o) = (Arc::clone(&ctx), Arc::clone(&order));
        ctx.post(Box::new(move || {
            o.lock().unwrap().push(1);
            let o2 = Arc::clone(&o);
            c.post(Box::new(move || {
                o2.lock().unwrap().push(3);
            }));
            o.lock().unwrap().push(2);
        }));

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn direct_is_current_only_inside_task() {
        let ctx = Arc::new(DirectContext::new());
        assert!(!ctx.is_current());
        let c = Arc::clone(&ctx);
        let seen = Arc::new(Mutex::new(false));
        let s = Arc::clone(&seen);
        ctx.post(Box::new(move || {
            *s.lock().unwrap() = c.is_current();
        }));
        assert!(*seen.lock().unwrap());
        assert!(!ctx.is_current());
    }

    #[test]
    fn direct_block_on_inline_when_current() {
        let ctx = Arc::new(DirectContext::new());
        let c = Arc::clone(&ctx);
        let result = Arc::new(Mutex::new(None));
        let r = Arc::clone(&result);
        ctx.post(Box::new(move || {
            let v = block_on(&*c, || 7).unwrap();
            *r.lock().unwrap() = Some(v);
        }));
        assert_eq!(*result.lock().unwrap(), Some(7));
    }

    // ── ThreadContext ────────────────────────────────────────────────

    #[test]
    fn thread_context_runs_on_named_worker() {
        let ctx = ThreadContext::new("tain-test-worker").unwrap();
        let name = block_on(&ctx, || thread::current().name().map(String::from)).unwrap();
        assert_eq!(name.as_deref(), Some("tain-test-worker"));
    }

    #[test]
    fn thread_context_serializes_in_order() {
        let ctx = ThreadContext::new("tain-order").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let o = Arc::clone(&order);
            ctx.post(Box::new(move || {
                o.lock().unwrap().push(i);
            }));
        }
        block_on(&ctx, || ()).unwrap();
        assert_eq!(*order.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn thread_context_is_current_from_inside() {
        let ctx = Arc::new(ThreadContext::new("tain-current").unwrap());
        let c = Arc::clone(&ctx);
        assert!(!ctx.is_current());
        let inside = block_on(&*ctx, move || c.is_current()).unwrap();
        assert!(inside);
    }

    #[test]
    fn thread_context_drop_drains_pending() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let ctx = ThreadContext::new("tain-drain").unwrap();
            for _ in 0..16 {
                let c = Arc::clone(&counter);
                ctx.post(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    // ── block_on error path ──────────────────────────────────────────

    struct DropsTasks;

    impl Context for DropsTasks {
        fn post(&self, task: Task) {
            drop(task);
        }
        fn is_current(&self) -> bool {
            false
        }
    }

    #[test]
    fn block_on_reports_dropped_task() {
        let err = block_on(&DropsTasks, || 1).unwrap_err();
        assert!(matches!(err, DispatchError::ContextGone));
    }

    #[test]
    fn dispatch_error_display() {
        assert_eq!(
            DispatchError::ContextGone.to_string(),
            "execution context is gone"
        );
    }

    // ── cross-context round trip ─────────────────────────────────────

    #[test]
    fn pair_threaded_round_trip() {
        let pair = ContextPair::threaded().unwrap();
        let host_name = block_on(&*pair.host, || thread::current().name().map(String::from))
            .unwrap();
        let script_name = block_on(&*pair.script, || thread::current().name().map(String::from))
            .unwrap();
        assert_eq!(host_name.as_deref(), Some("tain-host"));
        assert_eq!(script_name.as_deref(), Some("tain-script"));
    }

    #[test]
    fn nested_block_on_across_contexts() {
        let pair = ContextPair::threaded().unwrap();
        let script = Arc::clone(&pair.script);
        // Host task blocks on script work; contexts are distinct threads so
        // this must not deadlock.
        let v = block_on(&*pair.host, move || block_on(&*script, || 21).map(|x| x * 2))
            .unwrap()
            .unwrap();
        assert_eq!(v, 42);
    }
}
