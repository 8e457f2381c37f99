use std::future::Future;
use tokio::task::JoinSet;

/// Background work owned by one session: reply drains and completion waits.
///
/// Cancelling aborts every task and waits for all of them to stop, so no
/// cancelled task can touch the transport afterwards.
#[derive(Debug, Default)]
pub struct PendingTasks {
    set: JoinSet<()>,
}

impl PendingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        self.set.spawn(task);
    }

    /// Aborts all tasks and waits for them to finish. Returns how many were
    /// still running. Calling it with nothing pending is a no-op.
    pub async fn cancel_all(&mut self) -> usize {
        self.reap();
        let pending = self.set.len();
        self.set.abort_all();
        while self.set.join_next().await.is_some() {}
        pending
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    fn reap(&mut self) {
        while self.set.try_join_next().is_some() {}
    }
}
