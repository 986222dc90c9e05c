use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::workflows::draw::domain::{
    Applicant, ApplicantId, Clip, ClipId, Draw, DrawAggregate, DrawId, DrawPhase, Group, GroupId,
    GroupStatus, LotteryAssignment, LotteryOwner, PhaseTransition, PreLotteryStage, Suite,
    SuiteId, SuiteSize,
};
use crate::workflows::draw::notifications::{
    NotificationEvent, NotificationKind, NotificationPayload, NotificationPublisher, NotifyError,
    OutboxEntry,
};
use crate::workflows::draw::repository::{DrawCommit, DrawRepository, RepositoryError};
use crate::workflows::draw::DrawLifecycle;

pub(super) const DRAW: &str = "spring-2027";

pub(super) fn draw_id() -> DrawId {
    DrawId::new(DRAW)
}

pub(super) fn formed_at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2027, 2, 1, 9, minute, 0)
        .single()
        .expect("valid timestamp")
}

/// Builds draws directly in any phase, bypassing activation rules.
pub(super) struct DrawFixture {
    aggregate: DrawAggregate,
    arrivals: u32,
}

impl DrawFixture {
    pub(super) fn new() -> Self {
        Self {
            aggregate: DrawAggregate::new(Draw::new(draw_id(), "Spring 2027")),
            arrivals: 0,
        }
    }

    pub(super) fn suites(mut self, size: SuiteSize, count: usize) -> Self {
        for index in 0..count {
            let id = format!("s{size}-{}", index + 1);
            self.aggregate.suites.push(Suite {
                id: SuiteId::new(id.clone()),
                number: id.to_uppercase(),
                size,
                group: None,
            });
        }
        self
    }

    pub(super) fn loose_applicants(mut self, count: usize) -> Self {
        let start = self.aggregate.applicants.len();
        for index in start..start + count {
            self.aggregate.applicants.push(applicant(&format!("a{index}")));
        }
        self
    }

    /// A locked group whose members are fresh applicants; each call arrives
    /// one minute after the previous one.
    pub(super) fn group(mut self, id: &str, size: SuiteSize) -> Self {
        let members: Vec<Applicant> = (0..size)
            .map(|index| applicant(&format!("{id}-m{index}")))
            .collect();
        self.arrivals += 1;
        self.aggregate.groups.push(Group {
            id: GroupId::new(id),
            name: format!("Group {id}"),
            leader: members[0].id.clone(),
            members: members.iter().map(|member| member.id.clone()).collect(),
            size,
            status: GroupStatus::Locked,
            draw: Some(draw_id()),
            formed_at: formed_at(self.arrivals),
        });
        self.aggregate.applicants.extend(members);
        self
    }

    pub(super) fn status(mut self, id: &str, status: GroupStatus) -> Self {
        if let Some(group) = self
            .aggregate
            .groups
            .iter_mut()
            .find(|group| group.id.as_str() == id)
        {
            group.status = status;
        }
        self
    }

    pub(super) fn clip(mut self, id: &str, groups: &[&str]) -> Self {
        self.aggregate.clips.push(Clip {
            id: ClipId::new(id),
            draw: draw_id(),
            groups: groups.iter().map(|group| GroupId::new(*group)).collect(),
        });
        self
    }

    pub(super) fn number(mut self, number: u32, group: &str) -> Self {
        self.aggregate.lottery.push(LotteryAssignment::new(
            draw_id(),
            number,
            LotteryOwner::Group(GroupId::new(group)),
        ));
        self
    }

    pub(super) fn clip_number(mut self, number: u32, clip: &str) -> Self {
        self.aggregate.lottery.push(LotteryAssignment::new(
            draw_id(),
            number,
            LotteryOwner::Clip(ClipId::new(clip)),
        ));
        self
    }

    pub(super) fn housed(mut self, group: &str, suite: &str) -> Self {
        if let Some(target) = self
            .aggregate
            .suites
            .iter_mut()
            .find(|candidate| candidate.id.as_str() == suite)
        {
            target.group = Some(GroupId::new(group));
        }
        self
    }

    pub(super) fn deadlines(
        mut self,
        intent: Option<chrono::NaiveDate>,
        locking: Option<chrono::NaiveDate>,
    ) -> Self {
        self.aggregate.draw.intent_deadline = intent;
        self.aggregate.draw.locking_deadline = locking;
        self
    }

    pub(super) fn phase(mut self, target: DrawPhase) -> Self {
        advance_to(&mut self.aggregate, target);
        self
    }

    pub(super) fn build(self) -> DrawAggregate {
        self.aggregate
    }
}

pub(super) fn applicant(id: &str) -> Applicant {
    Applicant {
        id: ApplicantId::new(id),
        name: format!("Applicant {id}"),
        email: format!("{id}@example.edu"),
    }
}

pub(super) fn advance_to(aggregate: &mut DrawAggregate, target: DrawPhase) {
    while aggregate.phase() != target {
        let transition = match aggregate.phase() {
            DrawPhase::Draft => PhaseTransition::Activate,
            DrawPhase::PreLottery(PreLotteryStage::IntentSelection)
                if target == DrawPhase::PreLottery(PreLotteryStage::GroupFormation) =>
            {
                PhaseTransition::ProceedToGroupFormation
            }
            DrawPhase::PreLottery(_) => PhaseTransition::StartLottery,
            DrawPhase::Lottery => PhaseTransition::StartSelection,
            DrawPhase::SuiteSelection => PhaseTransition::Finish,
            DrawPhase::Results => panic!("cannot advance past results"),
        };
        aggregate
            .draw
            .advance(transition)
            .expect("fixture transition is valid");
    }
}

pub(super) fn intent_selection() -> DrawPhase {
    DrawPhase::PreLottery(PreLotteryStage::IntentSelection)
}

pub(super) fn build_lifecycle(
    aggregate: DrawAggregate,
) -> (DrawLifecycle<MemoryDrawRepository>, Arc<MemoryDrawRepository>) {
    let repository = Arc::new(MemoryDrawRepository::default());
    repository
        .insert(aggregate)
        .expect("fixture draw inserts");
    (DrawLifecycle::new(repository.clone()), repository)
}

#[derive(Default)]
pub(super) struct MemoryDrawRepository {
    draws: Arc<Mutex<HashMap<DrawId, DrawAggregate>>>,
    outbox: Arc<Mutex<Vec<(OutboxEntry, bool)>>>,
    sequence: AtomicU64,
    commits: AtomicUsize,
}

impl MemoryDrawRepository {
    pub(super) fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(super) fn stored(&self, id: &DrawId) -> DrawAggregate {
        self.fetch(id)
            .expect("fetch succeeds")
            .expect("draw exists")
    }

    pub(super) fn events(&self) -> Vec<NotificationEvent> {
        let guard = self.outbox.lock().expect("outbox mutex poisoned");
        guard.iter().map(|(entry, _)| entry.event.clone()).collect()
    }

    pub(super) fn events_of(&self, kind: NotificationKind) -> Vec<NotificationEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind == kind)
            .collect()
    }

    pub(super) fn attempts(&self) -> Vec<u32> {
        let guard = self.outbox.lock().expect("outbox mutex poisoned");
        guard.iter().map(|(entry, _)| entry.attempts).collect()
    }
}

impl DrawRepository for MemoryDrawRepository {
    fn insert(&self, aggregate: DrawAggregate) -> Result<DrawAggregate, RepositoryError> {
        let mut guard = self.draws.lock().expect("repository mutex poisoned");
        if guard.contains_key(aggregate.id()) {
            return Err(RepositoryError::Duplicate);
        }
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
        let mut guard = self.draws.lock().expect("repository mutex poisoned");
        let found = guard
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
        guard.insert(aggregate.id().clone(), aggregate.clone());

        let mut entries = self.outbox.lock().expect("outbox mutex poisoned");
        for event in outbox {
            let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            entries.push((
                OutboxEntry {
                    id,
                    event,
                    enqueued_at: Utc::now(),
                    attempts: 0,
                },
                false,
            ));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(aggregate)
    }

    fn pending_notifications(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let guard = self.outbox.lock().expect("outbox mutex poisoned");
        Ok(guard
            .iter()
            .filter(|(_, delivered)| !delivered)
            .map(|(entry, _)| entry.clone())
            .take(limit)
            .collect())
    }

    fn mark_delivered(&self, ids: &[u64]) -> Result<(), RepositoryError> {
        let mut guard = self.outbox.lock().expect("outbox mutex poisoned");
        for (entry, delivered) in guard.iter_mut() {
            if ids.contains(&entry.id) {
                *delivered = true;
            }
        }
        Ok(())
    }

    fn record_failed_attempt(&self, ids: &[u64]) -> Result<(), RepositoryError> {
        let mut guard = self.outbox.lock().expect("outbox mutex poisoned");
        for (entry, _) in guard.iter_mut() {
            if ids.contains(&entry.id) {
                entry.attempts += 1;
            }
        }
        Ok(())
    }
}

/// Repository whose commits always fail, for rollback checks.
pub(super) struct UnavailableRepository {
    pub(super) inner: MemoryDrawRepository,
}

impl DrawRepository for UnavailableRepository {
    fn insert(&self, aggregate: DrawAggregate) -> Result<DrawAggregate, RepositoryError> {
        self.inner.insert(aggregate)
    }

    fn fetch(&self, id: &DrawId) -> Result<Option<DrawAggregate>, RepositoryError> {
        self.inner.fetch(id)
    }

    fn commit(&self, _commit: DrawCommit) -> Result<DrawAggregate, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn pending_notifications(&self, limit: usize) -> Result<Vec<OutboxEntry>, RepositoryError> {
        self.inner.pending_notifications(limit)
    }

    fn mark_delivered(&self, ids: &[u64]) -> Result<(), RepositoryError> {
        self.inner.mark_delivered(ids)
    }

    fn record_failed_attempt(&self, ids: &[u64]) -> Result<(), RepositoryError> {
        self.inner.record_failed_attempt(ids)
    }
}

#[derive(Default)]
pub(super) struct MemoryPublisher {
    sent: Arc<Mutex<Vec<(NotificationKind, NotificationPayload)>>>,
    reject: Mutex<Option<ApplicantId>>,
}

impl MemoryPublisher {
    pub(super) fn rejecting(recipient: &str) -> Self {
        Self {
            sent: Arc::default(),
            reject: Mutex::new(Some(ApplicantId::new(recipient))),
        }
    }

    pub(super) fn recover(&self) {
        *self.reject.lock().expect("publisher mutex poisoned") = None;
    }

    pub(super) fn sent(&self) -> Vec<(NotificationKind, NotificationPayload)> {
        self.sent.lock().expect("publisher mutex poisoned").clone()
    }
}

impl NotificationPublisher for MemoryPublisher {
    fn notify(
        &self,
        kind: NotificationKind,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let reject = self.reject.lock().expect("publisher mutex poisoned");
        if reject.as_ref() == Some(&payload.recipient) {
            return Err(NotifyError::Rejected(payload.recipient.clone()));
        }
        self.sent
            .lock()
            .expect("publisher mutex poisoned")
            .push((kind, payload.clone()));
        Ok(())
    }
}

pub(super) fn group_ids(ids: &[&str]) -> Vec<GroupId> {
    ids.iter().map(|id| GroupId::new(*id)).collect()
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    serde_json::from_slice(&bytes).expect("json body")
}
