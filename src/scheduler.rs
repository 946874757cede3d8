use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::policy::RetryPolicy;
use crate::task::{Enqueue, TaskContext, TaskHandler, TaskQueue};

/// In-process deferred task runner.
///
/// Tasks are deduplicated by [`crate::task::Task::name`] while pending or
/// running, delayed, and retried with exponential backoff up to the policy's
/// attempt ceiling. A task's follow-up is enqueued only after it succeeds.
#[derive(Clone)]
pub struct LocalScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    handler: Arc<dyn TaskHandler>,
    policy: RetryPolicy,
    pending: Mutex<HashSet<String>>,
    idle: Notify,
}

impl LocalScheduler {
    #[must_use]
    pub fn new(handler: Arc<dyn TaskHandler>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                policy,
                pending: Mutex::new(HashSet::new()),
                idle: Notify::new(),
            }),
        }
    }

    pub async fn pending(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Waits until no task is pending or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl TaskQueue for LocalScheduler {
    async fn enqueue(&self, request: Enqueue) -> anyhow::Result<()> {
        Inner::submit(&self.inner, request).await;
        Ok(())
    }
}

impl Inner {
    async fn submit(this: &Arc<Self>, request: Enqueue) {
        let name = request.task.name();
        {
            let mut pending = this.pending.lock().await;
            if !pending.insert(name.clone()) {
                debug!("Task {} already queued, skipping duplicate", name);
                return;
            }
        }
        debug!("Queued task {} (delay {:?})", name, request.delay);
        tokio::spawn(Arc::clone(this).run(name, request));
    }

    // Boxed because a finished task submits its follow-up, which spawns `run` again.
    fn run(
        self: Arc<Self>,
        name: String,
        request: Enqueue,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            tokio::time::sleep(request.delay).await;

            let mut retry_count = 0u32;
            let next = loop {
                let context = TaskContext { retry_count };
                match self.handler.handle(request.task.clone(), context).await {
                    Ok(next) => break next,
                    Err(err) => {
                        if self.policy.is_exhausted(retry_count) {
                            error!(
                                "Task {} failed after {} attempts: {:#}",
                                name,
                                retry_count.saturating_add(1),
                                err
                            );
                            break None;
                        }
                        let delay = self.policy.backoff(retry_count);
                        warn!(
                            "Task {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                            name,
                            retry_count.saturating_add(1),
                            self.policy.retry_ceiling,
                            delay,
                            err
                        );
                        tokio::time::sleep(delay).await;
                        retry_count = retry_count.saturating_add(1);
                    }
                }
            };

            if let Some(next) = next {
                info!("Task {} completed, queueing {}", name, next.task.name());
                Inner::submit(&self, next).await;
            }

            let mut pending = self.pending.lock().await;
            pending.remove(&name);
            if pending.is_empty() {
                self.idle.notify_waiters();
            }
        })
    }
}
