use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, PoisonError},
};

use chrono::NaiveTime;
use log::{error, info};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::loop_worker::{daily_loop, repeating_loop};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Poll(String),
    DailyReport,
    SensorEvents,
}

impl TaskKey {
    fn label(&self) -> String {
        match self {
            TaskKey::Poll(subject) => format!("poll[{subject}]"),
            TaskKey::DailyReport => "daily report".into(),
            TaskKey::SensorEvents => "sensor events".into(),
        }
    }
}

struct ScheduledTask {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every background loop. Registering a key that is already scheduled
/// cancels the old loop first, so a key never has two live timers.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<TaskKey, ScheduledTask>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_repeating<F, Fut>(&self, key: TaskKey, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = key.label();
        self.spawn(key, move |token| repeating_loop(name, period, job, token));
    }

    pub fn schedule_daily<F, Fut>(&self, key: TaskKey, at: NaiveTime, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = key.label();
        self.spawn(key, move |token| daily_loop(name, at, job, token));
    }

    /// Start a custom loop. It must return once its token is cancelled.
    /// A loop already registered under `key` is cancelled, and the new one
    /// only starts after the old one has finished its current run.
    pub fn spawn<M, Fut>(&self, key: TaskKey, make: M)
    where
        M: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = tasks.remove(&key).map(|previous| {
            previous.cancel_token.cancel();
            info!("Replacing scheduled task {}", key.label());
            previous.handle
        });

        let cancel_token = CancellationToken::new();
        let run = make(cancel_token.clone());
        let label = key.label();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(err) = previous.await {
                    if err.is_panic() {
                        error!("Scheduled task {label} panicked: {err}");
                    }
                }
            }
            run.await;
        });
        tasks.insert(
            key,
            ScheduledTask {
                cancel_token,
                handle,
            },
        );
    }

    pub fn cancel(&self, key: &TaskKey) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match removed {
            Some(task) => {
                task.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel poll loops whose subject is not in `keep`.
    pub fn retain_polls(&self, keep: &[String]) {
        let stale: Vec<TaskKey> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|key| matches!(key, TaskKey::Poll(subject) if !keep.contains(subject)))
            .cloned()
            .collect();
        for key in stale {
            self.cancel(&key);
        }
    }

    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(false, |task| !task.handle.is_finished())
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel every loop and wait for them to wind down.
    pub async fn shutdown(&self) {
        let drained: Vec<(TaskKey, ScheduledTask)> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (_, task) in &drained {
            task.cancel_token.cancel();
        }
        for (key, task) in drained {
            if let Err(err) = task.handle.await {
                if err.is_panic() {
                    error!("Scheduled task {} panicked: {err}", key.label());
                }
            }
        }
    }
}
