// ABOUTME: Named periodic background tasks with per-task cancellation
// ABOUTME: A failing or panicking cycle is logged and retried after a short cooldown

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const FAILURE_COOLDOWN: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Snapshot of one registered task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub interval: Duration,
    pub started_at: DateTime<Utc>,
}

struct ScheduledTask {
    info: TaskInfo,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskScheduler {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `interval` under `name`, replacing any task already using that name
    pub async fn start<F>(&self, name: &str, interval: Duration, task: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.stop(name).await;

        let (cancel, mut cancelled) = watch::channel(false);
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            info!(task = %task_name, interval_secs = interval.as_secs_f64(), "Periodic task started");
            loop {
                let outcome = AssertUnwindSafe(async { task().await })
                    .catch_unwind()
                    .await;

                let wait = match outcome {
                    Ok(Ok(())) => interval,
                    Ok(Err(e)) => {
                        error!(task = %task_name, "Periodic task failed: {:#}", e);
                        FAILURE_COOLDOWN
                    }
                    Err(panic) => {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(task = %task_name, "Periodic task panicked: {}", reason);
                        FAILURE_COOLDOWN
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    // A dropped sender also ends the runner
                    _ = cancelled.changed() => break,
                }
            }
            debug!(task = %task_name, "Periodic task runner exited");
        });

        let info = TaskInfo {
            name: name.to_string(),
            interval,
            started_at: Utc::now(),
        };
        self.tasks.lock().await.insert(
            name.to_string(),
            ScheduledTask {
                info,
                cancel,
                handle,
            },
        );
    }

    /// Cancel the task registered under `name`; false when no such task exists
    pub async fn stop(&self, name: &str) -> bool {
        let Some(task) = self.tasks.lock().await.remove(name) else {
            return false;
        };

        let _ = task.cancel.send(true);
        let mut handle = task.handle;
        match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => info!(task = %name, "Periodic task stopped"),
            Ok(Err(e)) => warn!(task = %name, "Periodic task ended abnormally: {}", e),
            Err(_) => {
                warn!(task = %name, "Periodic task did not stop in time, aborting");
                handle.abort();
            }
        }
        true
    }

    /// Stop every registered task
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    pub async fn tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .lock()
            .await
            .values()
            .map(|t| t.info.clone())
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(name)
            .is_some_and(|t| !t.handle.is_finished())
    }
}
