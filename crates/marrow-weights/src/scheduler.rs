//! Background task scheduling for deferred spatial-index maintenance
//!
//! The deformer kicks off one bounded background task per deformation
//! update and always waits on the previous one before the next kickoff.
//! The scheduler is an injected dependency so hosts can route the work
//! onto their own worker pool, and tests can run it inline.

/// Handle to a spawned task. Dropping without `wait` detaches the task.
pub struct TaskHandle {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TaskHandle {
    /// A handle for work that already ran to completion.
    pub fn completed() -> Self {
        Self { handle: None }
    }

    /// Block until the task finishes.
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub trait TaskScheduler: Send + Sync {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) -> TaskHandle;
}

/// Runs each task on a freshly spawned thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl TaskScheduler for ThreadScheduler {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) -> TaskHandle {
        TaskHandle {
            handle: Some(std::thread::spawn(task)),
        }
    }
}

/// Runs each task immediately on the calling thread. Deterministic;
/// used by tests and single-threaded hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>) -> TaskHandle {
        task();
        TaskHandle::completed()
    }
}
