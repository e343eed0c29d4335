use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::{runtime::Handle, task::JoinHandle};

use crate::error::OperatorError;

/// Background execution context of a running operator. Created when the
/// operator starts and handed to every controller it starts.
#[derive(Debug, Clone)]
pub struct Executor {
    handle: Handle,
    started_at: DateTime<Utc>,
}

impl Executor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            started_at: Utc::now(),
        }
    }

    /// Executor on the runtime the caller is running on.
    pub fn current() -> Result<Self, OperatorError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| OperatorError::Runtime(e.to_string()))
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
