use parking_lot::Mutex;
use tracing::error;

/// Where merge workers report errors they cannot return to anyone.
///
/// Called from worker threads, possibly concurrently. Implementations record the
/// error; deciding whether to abort the task is up to whoever owns the sink.
pub trait FailureSink: Send + Sync {
    fn report_exception(&self, err: anyhow::Error);
}

/// Default sink: logs and keeps every reported error for the owning task to inspect.
#[derive(Debug, Default)]
pub struct TaskFailures {
    errors: Mutex<Vec<anyhow::Error>>,
}

impl TaskFailures {
    pub fn new() -> Self { Self::default() }

    pub fn count(&self) -> usize { self.errors.lock().len() }

    pub fn is_failed(&self) -> bool { self.count() > 0 }

    /// Rendered message of the first failure, if any.
    pub fn first_message(&self) -> Option<String> {
        self.errors.lock().first().map(|e| format!("{:#}", e))
    }

    pub fn take_all(&self) -> Vec<anyhow::Error> { std::mem::take(&mut *self.errors.lock()) }
}

impl FailureSink for TaskFailures {
    fn report_exception(&self, err: anyhow::Error) {
        error!("shuffle merge failure: {:#}", err);
        self.errors.lock().push(err);
    }
}
