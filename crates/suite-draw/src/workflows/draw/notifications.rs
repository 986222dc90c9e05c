//! Notification events written to the outbox in the same commit as the state
//! change that caused them, and the dispatcher that later delivers them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::domain::{Applicant, ApplicantId, DrawId, GroupId, SuiteSize};
use super::repository::{DrawRepository, RepositoryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DrawInvitation,
    SelectionInvite,
    LotteryResult,
    IntentReminder,
    LockingReminder,
}

impl NotificationKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::DrawInvitation => "draw_invitation",
            Self::SelectionInvite => "selection_invite",
            Self::LotteryResult => "lottery_result",
            Self::IntentReminder => "intent_reminder",
            Self::LockingReminder => "locking_reminder",
        }
    }
}

/// Rendered as "#rank out of total_in_size groups of size group_size".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryResultDetail {
    pub lottery_number: u32,
    pub group_size: SuiteSize,
    pub rank: usize,
    pub total_in_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub draw_id: DrawId,
    pub recipient: ApplicantId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lottery: Option<LotteryResultDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub payload: NotificationPayload,
}

impl NotificationEvent {
    pub fn to_applicant(kind: NotificationKind, draw_id: &DrawId, applicant: &Applicant) -> Self {
        Self {
            kind,
            payload: NotificationPayload {
                draw_id: draw_id.clone(),
                recipient: applicant.id.clone(),
                email: applicant.email.clone(),
                group_id: None,
                lottery: None,
            },
        }
    }

    pub fn for_group(mut self, group_id: &GroupId) -> Self {
        self.payload.group_id = Some(group_id.clone());
        self
    }

    pub fn with_lottery(mut self, detail: LotteryResultDetail) -> Self {
        self.payload.lottery = Some(detail);
        self
    }
}

/// An event persisted in the outbox, awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: u64,
    pub event: NotificationEvent,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Outbound delivery hook (mailer, queue, webhook adapters).
pub trait NotificationPublisher: Send + Sync {
    fn notify(
        &self,
        kind: NotificationKind,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
    #[error("recipient {0} rejected the notification")]
    Rejected(ApplicantId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Drains the outbox through a publisher. Entries are marked delivered only
/// after the publisher accepts them, so a failed attempt is retried on the next pass.
pub struct NotificationDispatcher<R, P> {
    repository: Arc<R>,
    publisher: Arc<P>,
    batch_size: usize,
}

impl<R, P> NotificationDispatcher<R, P>
where
    R: DrawRepository + 'static,
    P: NotificationPublisher + 'static,
{
    pub fn new(repository: Arc<R>, publisher: Arc<P>, batch_size: usize) -> Self {
        Self {
            repository,
            publisher,
            batch_size: batch_size.max(1),
        }
    }

    pub fn dispatch_pending(&self) -> Result<DispatchReport, RepositoryError> {
        let pending = self.repository.pending_notifications(self.batch_size)?;
        let mut report = DispatchReport::default();
        let mut delivered = Vec::with_capacity(pending.len());
        let mut failed = Vec::new();

        for entry in pending {
            match self.publisher.notify(entry.event.kind, &entry.event.payload) {
                Ok(()) => {
                    delivered.push(entry.id);
                    report.delivered += 1;
                }
                Err(err) => {
                    warn!(
                        outbox_id = entry.id,
                        kind = entry.event.kind.label(),
                        recipient = %entry.event.payload.recipient,
                        attempts = entry.attempts + 1,
                        error = %err,
                        "notification delivery failed; will retry"
                    );
                    failed.push(entry.id);
                    report.failed += 1;
                }
            }
        }

        if !delivered.is_empty() {
            self.repository.mark_delivered(&delivered)?;
        }
        if !failed.is_empty() {
            self.repository.record_failed_attempt(&failed)?;
        }

        Ok(report)
    }

    /// Runs forever, draining the outbox every `every`. Repository and
    /// publisher calls block, so each pass runs on the blocking pool.
    pub async fn run(self, every: Duration) {
        let dispatcher = Arc::new(self);
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let pass = Arc::clone(&dispatcher);
            match tokio::task::spawn_blocking(move || pass.dispatch_pending()).await {
                Ok(Ok(report)) if report.delivered + report.failed > 0 => {
                    debug!(
                        delivered = report.delivered,
                        failed = report.failed,
                        "outbox drained"
                    );
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "outbox unavailable"),
                Err(err) => warn!(error = %err, "outbox dispatch task failed"),
            }
        }
    }
}
