use anyhow::{anyhow, Result};
use std::thread::{self, JoinHandle};

/// A background operation observed by non-blocking polls. The outcome is
/// kept once the thread has been joined.
pub struct TaskHandle<T> {
    handle: Option<JoinHandle<Result<T>>>,
    outcome: Option<Result<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub fn spawn<F>(name: &str, work: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(work)?;
        Ok(Self {
            handle: Some(handle),
            outcome: None,
        })
    }

    /// `None` while the task is still running.
    pub fn poll(&mut self) -> Option<&Result<T>> {
        let finished = self
            .handle
            .as_ref()
            .map_or(false, |handle| handle.is_finished());
        if finished {
            if let Some(handle) = self.handle.take() {
                self.outcome = Some(
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("background task panicked"))),
                );
            }
        }
        self.outcome.as_ref()
    }

    pub fn succeeded(&mut self) -> bool {
        matches!(self.poll(), Some(Ok(_)))
    }
}
