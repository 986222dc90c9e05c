use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use suite_draw::workflows::draw::{
    Applicant, ApplicantId, Clip, ClipId, Draw, DrawAggregate, DrawCommit, DrawId,
    DrawRepository, Group, GroupId, GroupStatus, NotificationKind, NotificationPayload,
    NotificationPublisher, NotifyError, OutboxEntry, RepositoryError, Suite, SuiteId, SuiteSize,
};
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Process-local draw store. Commits check the expected version and the
/// aggregate invariants under one lock, so a draw and its outbox move together.
/// The outbox only holds undelivered entries.
#[derive(Default, Clone)]
pub(crate) struct InMemoryDrawRepository {
    draws: Arc<Mutex<HashMap<DrawId, DrawAggregate>>>,
    outbox: Arc<Mutex<Vec<OutboxEntry>>>,
    sequence: Arc<AtomicU64>,
}

impl DrawRepository for InMemoryDrawRepository {
    fn insert(&self, aggregate: DrawAggregate) -> Result<DrawAggregate, RepositoryError> {
        let mut guard = self.draws.lock().expect("repository mutex poisoned");
        if guard.contains_key(aggregate.id()) {
            return Err(RepositoryError::Duplicate);
        }
        aggregate
            .check_invariants()
            .map_err(RepositoryError::Invariant)?;
        guard.insert(aggregate.id().clone(), aggregate.clone());
        Ok(aggregate)
    }

    fn fetch(&self, id: &DrawId) -> Result<Option<DrawAggregate>, RepositoryError> {
        let guard = self.draws.lock().expect("repository mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn commit(&self, commit: DrawCommit) -> Result<DrawAggregate, RepositoryError> {
        let DrawCommit {
            expected_version,
            mut aggregate,
            outbox,
        } = commit;

        let mut draws = self.draws.lock().expect("repository mutex poisoned");
        let found = draws
            .get(aggregate.id())
            .map(|current| current.version)
            .ok_or(RepositoryError::NotFound)?;
        if found != expected_version {
            return Err(RepositoryError::VersionMismatch {
                expected: expected_version,
                found,
            });
        }
        aggregate
            .check_invariants()
            .map_err(RepositoryError::Invariant)?;

        aggregate.version = expected_version + 1;
        let mut entries = self.outbox.lock().expect("outbox mutex poisoned");
        let enqueued_at = Utc::now();
        for event in outbox {
            entries.push(OutboxEntry {
                id: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
                event,
                enqueued_at,
                attempts: 0,
            });
        }
        draws.insert(aggregate.id().clone(), aggregate.clone());
        Ok(aggregate)
    }

    fn pending_notifications(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let guard = self.outbox.lock().expect("outbox mutex poisoned");
        Ok(guard.iter().take(limit).cloned().collect())
    }

    fn mark_delivered(&self, ids: &[u64]) -> Result<(), RepositoryError> {
        let mut guard = self.outbox.lock().expect("outbox mutex poisoned");
        guard.retain(|entry| !ids.contains(&entry.id));
        Ok(())
    }

    fn record_failed_attempt(&self, ids: &[u64]) -> Result<(), RepositoryError> {
        let mut guard = self.outbox.lock().expect("outbox mutex poisoned");
        for entry in guard.iter_mut().filter(|entry| ids.contains(&entry.id)) {
            entry.attempts += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
impl InMemoryDrawRepository {
    pub(crate) fn outbox_len(&self) -> usize {
        self.outbox.lock().expect("outbox mutex poisoned").len()
    }
}

/// Delivers notifications to the log; stands in for a mailer. Keeps a
/// running count per kind rather than the payloads.
#[derive(Default, Clone)]
pub(crate) struct LoggingNotificationPublisher {
    delivered: Arc<Mutex<HashMap<NotificationKind, usize>>>,
}

impl NotificationPublisher for LoggingNotificationPublisher {
    fn notify(
        &self,
        kind: NotificationKind,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        info!(
            kind = kind.label(),
            draw_id = %payload.draw_id,
            recipient = %payload.recipient,
            email = %payload.email,
            "notification delivered"
        );
        let mut guard = self.delivered.lock().expect("publisher mutex poisoned");
        *guard.entry(kind).or_default() += 1;
        Ok(())
    }
}

impl LoggingNotificationPublisher {
    /// Deliveries so far, keyed by notification label.
    pub(crate) fn delivered_by_kind(&self) -> BTreeMap<&'static str, usize> {
        self.delivered
            .lock()
            .expect("publisher mutex poisoned")
            .iter()
            .map(|(kind, count)| (kind.label(), *count))
            .collect()
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

pub(crate) const DEMO_DRAW_ID: &str = "demo-draw";

fn formed_at(start: NaiveDate, offset_hours: i64) -> DateTime<Utc> {
    Utc.from_utc_datetime(&start.and_time(NaiveTime::default())) + Duration::hours(offset_hours)
}

/// A draft draw with five doubles competing for three double suites, a clip
/// of a double and a single, and two applicants still looking for a group.
pub(crate) fn demo_draw(today: NaiveDate) -> DrawAggregate {
    let draw_id = DrawId::new(DEMO_DRAW_ID);
    let draw = Draw::new(draw_id.clone(), "Demo housing draw").with_deadlines(
        today.checked_add_signed(Duration::days(7)),
        today.checked_add_signed(Duration::days(14)),
    );
    let mut aggregate = DrawAggregate::new(draw);

    let roster: [(&str, &[&str], GroupStatus); 6] = [
        ("willow", &["ivy", "jon"], GroupStatus::Locked),
        ("elm", &["kai"], GroupStatus::Locked),
        ("maple", &["ava", "ben"], GroupStatus::Locked),
        ("cedar", &["cora", "dev"], GroupStatus::Locked),
        ("birch", &["eli", "fern"], GroupStatus::Finalizing),
        ("aspen", &["gia", "hal"], GroupStatus::Locked),
    ];
    for (offset, (id, members, status)) in roster.iter().enumerate() {
        for member in members.iter() {
            aggregate.applicants.push(applicant(member));
        }
        aggregate.groups.push(Group {
            id: GroupId::new(*id),
            name: format!("{} suite", id),
            leader: ApplicantId::new(members[0]),
            members: members.iter().map(|member| ApplicantId::new(*member)).collect(),
            size: members.len() as SuiteSize,
            status: *status,
            draw: Some(draw_id.clone()),
            formed_at: formed_at(today, offset as i64),
        });
    }
    aggregate.applicants.push(applicant("lea"));
    aggregate.applicants.push(applicant("max"));

    aggregate.clips.push(Clip {
        id: ClipId::new("riverside"),
        draw: draw_id,
        groups: vec![GroupId::new("willow"), GroupId::new("elm")],
    });

    let suites: [(&str, SuiteSize); 7] = [
        ("north-201", 2),
        ("north-202", 2),
        ("north-203", 2),
        ("south-110", 1),
        ("south-111", 1),
        ("south-112", 1),
        ("east-400", 4),
    ];
    for (id, size) in suites {
        aggregate.suites.push(Suite {
            id: SuiteId::new(id),
            number: id.to_uppercase(),
            size,
            group: None,
        });
    }

    aggregate
}

fn applicant(id: &str) -> Applicant {
    Applicant {
        id: ApplicantId::new(id),
        name: id.to_string(),
        email: format!("{id}@campus.example"),
    }
}
