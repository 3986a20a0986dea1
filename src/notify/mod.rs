//! Outbound notifications.
//!
//! The external notifier is fire-and-forget from the engine's point of view:
//! [`Dispatcher::dispatch`] never returns an error. Every notification is also
//! posted to the in-process [`NoticeBoard`], which works even when the
//! notifier is down.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{log_info, log_warn};

#[cfg(test)]
mod recording;
#[cfg(test)]
pub use recording::RecordingNotifier;

const ENABLE_LOGS: bool = true;
const NOTICE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Bypasses do-not-disturb on the receiving device.
    Critical,
    High,
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub targets: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log. Used when no transport is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        log::info!(
            "[{:?}] {}: {} -> {:?}",
            notification.severity,
            notification.title,
            notification.message,
            notification.targets
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notice {
    pub id: String,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Bounded list of local notices, newest last.
#[derive(Default)]
pub struct NoticeBoard {
    notices: Mutex<VecDeque<Notice>>,
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, title: &str, message: &str) -> String {
        let notice = Notice {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        };
        let id = notice.id.clone();
        let mut notices = self.notices.lock().unwrap_or_else(PoisonError::into_inner);
        if notices.len() >= NOTICE_CAPACITY {
            notices.pop_front();
        }
        notices.push_back(notice);
        id
    }

    pub fn list(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn dismiss(&self, id: &str) -> bool {
        let mut notices = self.notices.lock().unwrap_or_else(PoisonError::into_inner);
        let before = notices.len();
        notices.retain(|notice| notice.id != id);
        notices.len() != before
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    notices: Arc<NoticeBoard>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, notices: Arc<NoticeBoard>) -> Self {
        Self { notifier, notices }
    }

    pub fn notices(&self) -> &Arc<NoticeBoard> {
        &self.notices
    }

    /// Post a local notice, then hand the notification to the notifier.
    /// Returns whether the notifier accepted it.
    pub async fn dispatch(&self, notification: Notification) -> bool {
        self.notices.post(&notification.title, &notification.message);

        match self.notifier.send(&notification).await {
            Ok(()) => {
                log_info!("Sent notification '{}'", notification.title);
                true
            }
            Err(err) => {
                log_warn!(
                    "Notification '{}' could not be delivered: {err:#}",
                    notification.title
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> Notification {
        Notification {
            title: "Bella: critical low".into(),
            message: "Glucose 50 mg/dL".into(),
            severity: Severity::Critical,
            targets: vec!["phone".into()],
        }
    }

    #[tokio::test]
    async fn dispatch_delivers_and_posts_notice() {
        let notifier = Arc::new(RecordingNotifier::new());
        let board = Arc::new(NoticeBoard::new());
        let dispatcher = Dispatcher::new(notifier.clone(), board.clone());

        assert!(dispatcher.dispatch(notification()).await);
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(board.list().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_still_posts_notice() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.set_failing(true);
        let board = Arc::new(NoticeBoard::new());
        let dispatcher = Dispatcher::new(notifier.clone(), board.clone());

        assert!(!dispatcher.dispatch(notification()).await);
        assert!(notifier.sent().is_empty());
        assert_eq!(board.list()[0].title, "Bella: critical low");
    }

    #[test]
    fn notice_board_is_bounded_and_dismissable() {
        let board = NoticeBoard::new();
        let first = board.post("first", "");
        for i in 0..NOTICE_CAPACITY {
            board.post(&format!("n{i}"), "");
        }
        assert_eq!(board.list().len(), NOTICE_CAPACITY);
        assert!(!board.dismiss(&first));

        let last = board.list().last().unwrap().id.clone();
        assert!(board.dismiss(&last));
        assert_eq!(board.list().len(), NOTICE_CAPACITY - 1);
    }
}
