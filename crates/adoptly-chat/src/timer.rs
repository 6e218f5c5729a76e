use std::time::Duration;

use tokio::task::AbortHandle;

/// A callback scheduled on the runtime. Dropping the handle cancels it.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<AbortHandle>,
}

impl ScheduledTask {
    pub fn after<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        })
        .abort_handle();
        Self {
            handle: Some(handle),
        }
    }

    /// Forget the task without cancelling it. Used by a callback to release
    /// its own handle.
    pub fn disarm(mut self) {
        self.handle.take();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
