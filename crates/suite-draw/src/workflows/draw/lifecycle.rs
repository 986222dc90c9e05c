use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::domain::{
    Applicant, ApplicantId, DrawAction, DrawAggregate, DrawId, DrawPhase, GroupId, GroupStatus,
    LotteryAssignment, LotteryId, LotteryOwner, PhaseTransition, ReminderKind, ReminderRecord,
    SuiteId, SuiteSize,
};
use super::error::{DrawError, GuardViolation};
use super::lottery::LotteryAssignmentEngine;
use super::notifications::{LotteryResultDetail, NotificationEvent, NotificationKind};
use super::pruning::{detach_group, OversubscriptionPruner, PruneOutcome, PruneTarget};
use super::registry::{GroupRank, GroupRegistry, SizeDemand};
use super::repository::{DrawCommit, DrawRepository, RepositoryError};
use super::selection::{EligibleGroup, PickOutcome, SelectionTurnScheduler, SuiteSelection};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseOutcome {
    pub draw_id: DrawId,
    pub phase: DrawPhase,
    pub notifications: usize,
}

/// A unit still waiting for a lottery number when the lottery opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub owner: LotteryOwner,
    pub size: SuiteSize,
    pub groups: Vec<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LotteryStartOutcome {
    pub draw_id: DrawId,
    pub phase: DrawPhase,
    pub discarded: usize,
    pub roster: Vec<RosterEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionStartOutcome {
    pub draw_id: DrawId,
    pub phase: DrawPhase,
    pub reclaimed: usize,
    pub eligible: Vec<EligibleGroup>,
    pub lottery_results: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PickResult {
    pub draw_id: DrawId,
    pub phase: DrawPhase,
    pub pick: PickOutcome,
    pub next: Vec<EligibleGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderOutcome {
    pub draw_id: DrawId,
    pub kind: ReminderKind,
    pub recipients: usize,
    pub sent_at: DateTime<Utc>,
}

/// Per-draw write locks. An entry lives while some writer holds or waits
/// on it and is dropped by the last one out.
#[derive(Default)]
struct DrawLocks {
    inner: Mutex<HashMap<DrawId, Arc<Mutex<()>>>>,
}

impl DrawLocks {
    fn lock_for(&self, draw_id: &DrawId) -> Arc<Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(draw_id.clone()).or_default())
    }

    /// Gives back a handle from `lock_for`. Clones are only taken under the
    /// map lock, so a count of one here means nobody else can reach the entry.
    fn release(&self, draw_id: &DrawId, handle: Arc<Mutex<()>>) {
        drop(handle);
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(draw_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(draw_id);
        }
    }
}

/// Entry point for every draw operation. Writes are serialized per draw and
/// committed as one aggregate together with the notifications they raise.
pub struct DrawLifecycle<R> {
    repository: Arc<R>,
    locks: DrawLocks,
}

impl<R> DrawLifecycle<R>
where
    R: DrawRepository + 'static,
{
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            locks: DrawLocks::default(),
        }
    }

    pub fn repository(&self) -> Arc<R> {
        Arc::clone(&self.repository)
    }

    /// Loads, mutates a working copy and commits it. Nothing is written when
    /// `op` fails, or when it changed nothing and raised no notifications.
    fn write<T>(
        &self,
        draw_id: &DrawId,
        op: impl FnOnce(&mut DrawAggregate, &mut Vec<NotificationEvent>) -> Result<T, DrawError>,
    ) -> Result<(T, DrawAggregate), DrawError> {
        let handle = self.locks.lock_for(draw_id);
        let result = {
            let _guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
            self.write_locked(draw_id, op)
        };
        self.locks.release(draw_id, handle);
        result
    }

    fn write_locked<T>(
        &self,
        draw_id: &DrawId,
        op: impl FnOnce(&mut DrawAggregate, &mut Vec<NotificationEvent>) -> Result<T, DrawError>,
    ) -> Result<(T, DrawAggregate), DrawError> {
        let current = self.load(draw_id)?;
        let mut working = current.clone();
        let mut outbox = Vec::new();
        let value = op(&mut working, &mut outbox)?;

        if working == current && outbox.is_empty() {
            debug!(draw_id = %draw_id, "nothing changed; skipping commit");
            return Ok((value, current));
        }

        let stored = self.repository.commit(DrawCommit {
            expected_version: current.version,
            aggregate: working,
            outbox,
        })?;
        Ok((value, stored))
    }

    fn load(&self, draw_id: &DrawId) -> Result<DrawAggregate, DrawError> {
        self.repository
            .fetch(draw_id)?
            .ok_or_else(|| DrawError::NotFound(draw_id.clone()))
    }

    /// Registers a new draft draw with its applicants, suites and groups.
    /// Suites, lottery numbers and the version start empty; only later
    /// phases may fill them.
    pub fn open_draw(&self, aggregate: DrawAggregate) -> Result<DrawAggregate, DrawError> {
        let mut problems = Vec::new();
        if aggregate.phase() != DrawPhase::Draft {
            problems.push(format!(
                "Draw {} must be opened in the draft phase.",
                aggregate.id()
            ));
        }
        if aggregate.version != 0 {
            problems.push(format!(
                "Draw {} must be opened at version 0, not {}.",
                aggregate.id(),
                aggregate.version
            ));
        }
        let bound: Vec<String> = aggregate
            .suites
            .iter()
            .filter(|suite| suite.group.is_some())
            .map(|suite| suite.id.to_string())
            .collect();
        if !bound.is_empty() {
            problems.push(format!(
                "Suites cannot be assigned before suite selection: {}.",
                bound.join(", ")
            ));
        }
        if !aggregate.lottery.is_empty() {
            problems.push(format!(
                "Lottery numbers cannot be issued before the lottery starts ({} present).",
                aggregate.lottery.len()
            ));
        }
        if let Err(violations) = aggregate.check_invariants() {
            problems.extend(violations);
        }
        if !problems.is_empty() {
            return Err(DrawError::Validation(problems));
        }

        let draw_id = aggregate.id().clone();
        let stored = self.repository.insert(aggregate).map_err(|err| match err {
            RepositoryError::Duplicate => {
                DrawError::invalid(format!("Draw {draw_id} already exists."))
            }
            other => other.into(),
        })?;
        info!(draw_id = %draw_id, "draw opened");
        Ok(stored)
    }

    pub fn draw(&self, draw_id: &DrawId) -> Result<DrawAggregate, DrawError> {
        self.load(draw_id)
    }

    pub fn activate(&self, draw_id: &DrawId) -> Result<PhaseOutcome, DrawError> {
        let (notifications, stored) = self.write(draw_id, |aggregate, outbox| {
            PhaseTransition::Activate.check(aggregate.phase())?;

            let mut problems = Vec::new();
            let applicants = aggregate.applicants.len();
            let beds = GroupRegistry::new(aggregate).bed_count();
            if applicants == 0 {
                problems.push("Draw must have at least one applicant.".to_string());
            }
            if beds < applicants {
                problems.push(format!(
                    "Draw must have at least one bed per applicant ({beds} beds for {applicants} applicants)."
                ));
            }
            if !problems.is_empty() {
                return Err(DrawError::Validation(problems));
            }

            aggregate.draw.advance(PhaseTransition::Activate)?;
            let draw_id = aggregate.id().clone();
            outbox.extend(aggregate.applicants.iter().map(|applicant| {
                NotificationEvent::to_applicant(NotificationKind::DrawInvitation, &draw_id, applicant)
            }));
            Ok(outbox.len())
        })?;

        info!(draw_id = %draw_id, invitations = notifications, "draw activated");
        Ok(PhaseOutcome {
            draw_id: draw_id.clone(),
            phase: stored.phase(),
            notifications,
        })
    }

    pub fn proceed_to_group_formation(&self, draw_id: &DrawId) -> Result<PhaseOutcome, DrawError> {
        let (_, stored) = self.write(draw_id, |aggregate, _| {
            aggregate
                .draw
                .advance(PhaseTransition::ProceedToGroupFormation)?;
            Ok(())
        })?;

        info!(draw_id = %draw_id, "draw moved to group formation");
        Ok(PhaseOutcome {
            draw_id: draw_id.clone(),
            phase: stored.phase(),
            notifications: 0,
        })
    }

    /// Opens numbering. Assignments that no longer cover any group are dropped
    /// and the units still waiting for a number are returned.
    pub fn start_lottery(&self, draw_id: &DrawId) -> Result<LotteryStartOutcome, DrawError> {
        let ((discarded, roster), stored) = self.write(draw_id, |aggregate, _| {
            PhaseTransition::StartLottery.check(aggregate.phase())?;

            let stale = LotteryAssignmentEngine::orphaned(aggregate);
            let discarded = LotteryAssignmentEngine::discard(aggregate, &stale);
            let roster = lottery_roster(aggregate);

            aggregate.draw.advance(PhaseTransition::StartLottery)?;
            Ok((discarded, roster))
        })?;

        info!(
            draw_id = %draw_id,
            discarded,
            awaiting_numbers = roster.len(),
            "lottery started"
        );
        Ok(LotteryStartOutcome {
            draw_id: draw_id.clone(),
            phase: stored.phase(),
            discarded,
            roster,
        })
    }

    pub fn start_selection(&self, draw_id: &DrawId) -> Result<SelectionStartOutcome, DrawError> {
        let (outcome, stored) = self.write(draw_id, |aggregate, outbox| {
            PhaseTransition::StartSelection.check(aggregate.phase())?;

            let orphaned = LotteryAssignmentEngine::orphaned(aggregate);
            let reclaimed = LotteryAssignmentEngine::discard(aggregate, &orphaned);

            let unnumbered = GroupRegistry::new(aggregate).unnumbered_groups().len();
            if unnumbered > 0 {
                return Err(GuardViolation::LotteryIncomplete { unnumbered }.into());
            }

            aggregate.draw.advance(PhaseTransition::StartSelection)?;

            let eligible = SelectionTurnScheduler::next_groups(aggregate);
            outbox.extend(selection_invites(aggregate, &eligible));
            if eligible.is_empty() {
                aggregate.draw.advance(PhaseTransition::Finish)?;
            }

            let results = lottery_results(aggregate);
            let lottery_results = results.len();
            outbox.extend(results);

            Ok(SelectionStartOutcome {
                draw_id: aggregate.id().clone(),
                phase: aggregate.phase(),
                reclaimed,
                eligible,
                lottery_results,
            })
        })?;

        info!(
            draw_id = %draw_id,
            reclaimed = outcome.reclaimed,
            eligible = outcome.eligible.len(),
            "suite selection started"
        );
        Ok(SelectionStartOutcome {
            phase: stored.phase(),
            ..outcome
        })
    }

    pub fn assign_lottery_number(
        &self,
        draw_id: &DrawId,
        number: i64,
        owner: LotteryOwner,
    ) -> Result<LotteryAssignment, DrawError> {
        let (assignment, _) = self.write(draw_id, |aggregate, _| {
            LotteryAssignmentEngine::assign(aggregate, number, owner)
        })?;
        info!(
            draw_id = %draw_id,
            number = assignment.number,
            owner = %assignment.owner,
            "lottery number assigned"
        );
        Ok(assignment)
    }

    pub fn retract_lottery_number(
        &self,
        draw_id: &DrawId,
        lottery_id: &LotteryId,
    ) -> Result<LotteryAssignment, DrawError> {
        let (assignment, _) = self.write(draw_id, |aggregate, _| {
            LotteryAssignmentEngine::retract(aggregate, lottery_id)
        })?;
        info!(draw_id = %draw_id, number = assignment.number, "lottery number retracted");
        Ok(assignment)
    }

    /// Returns whether the stored `selected` flag changed.
    pub fn refresh_selected(
        &self,
        draw_id: &DrawId,
        lottery_id: &LotteryId,
    ) -> Result<bool, DrawError> {
        let (changed, _) = self.write(draw_id, |aggregate, _| {
            if !aggregate
                .lottery
                .iter()
                .any(|assignment| &assignment.id == lottery_id)
            {
                return Err(DrawError::invalid(format!(
                    "Lottery assignment {lottery_id} does not exist."
                )));
            }
            Ok(LotteryAssignmentEngine::recompute_selected(
                aggregate, lottery_id,
            ))
        })?;
        Ok(changed)
    }

    /// Prunes each target size in its own commit; a failing size is reported
    /// and leaves the other sizes unaffected.
    pub fn prune(&self, draw_id: &DrawId, target: PruneTarget) -> Result<PruneOutcome, DrawError> {
        let snapshot = self.load(draw_id)?;
        let phase = snapshot.phase();
        if !phase.is_pre_lottery() {
            return Err(GuardViolation::WrongPhase {
                action: DrawAction::Prune,
                phase,
            }
            .into());
        }

        let mut outcome = PruneOutcome::default();
        for size in OversubscriptionPruner::target_sizes(&snapshot, target) {
            let result = self.write(draw_id, |aggregate, _| {
                let phase = aggregate.phase();
                if !phase.is_pre_lottery() {
                    return Err(GuardViolation::WrongPhase {
                        action: DrawAction::Prune,
                        phase,
                    }
                    .into());
                }
                OversubscriptionPruner::prune_size(aggregate, size)
            });

            match result {
                Ok((removed, _)) => {
                    outcome.pruned.insert(size, removed.len());
                    outcome.removed.extend(removed);
                }
                Err(err) => {
                    warn!(draw_id = %draw_id, size, error = %err, "prune failed for size");
                    outcome.failures.insert(size, err.to_string());
                }
            }
        }
        outcome.summarize();

        info!(draw_id = %draw_id, summary = %outcome.message, "prune finished");
        Ok(outcome)
    }

    /// Detaches one group before suite selection begins, as when a group dissolves.
    pub fn withdraw_group(
        &self,
        draw_id: &DrawId,
        group_id: &GroupId,
    ) -> Result<GroupId, DrawError> {
        self.write(draw_id, |aggregate, _| {
            let phase = aggregate.phase();
            if !phase.before_selection() {
                return Err(GuardViolation::WrongPhase {
                    action: DrawAction::WithdrawGroup,
                    phase,
                }
                .into());
            }
            detach_group(aggregate, group_id)
        })?;

        info!(draw_id = %draw_id, group_id = %group_id, "group withdrawn from draw");
        Ok(group_id.clone())
    }

    pub fn next_groups(&self, draw_id: &DrawId) -> Result<Vec<EligibleGroup>, DrawError> {
        let aggregate = self.load(draw_id)?;
        let phase = aggregate.phase();
        if phase != DrawPhase::SuiteSelection {
            return Err(GuardViolation::WrongPhase {
                action: DrawAction::ListNextGroups,
                phase,
            }
            .into());
        }
        Ok(SelectionTurnScheduler::next_groups(&aggregate))
    }

    pub fn pick_suite(
        &self,
        draw_id: &DrawId,
        group_id: &GroupId,
        suite_id: &SuiteId,
    ) -> Result<PickResult, DrawError> {
        let selection = SuiteSelection {
            group_id: group_id.clone(),
            suite_id: suite_id.clone(),
        };
        self.pick_suites(draw_id, group_id, &[selection])
    }

    /// Picks for the unit reported by `group_id`; a clip supplies one
    /// selection per member group. Invites go to units that became eligible,
    /// and the draw finishes once no unit can pick.
    pub fn pick_suites(
        &self,
        draw_id: &DrawId,
        group_id: &GroupId,
        selections: &[SuiteSelection],
    ) -> Result<PickResult, DrawError> {
        let ((pick, next), stored) = self.write(draw_id, |aggregate, outbox| {
            let before = SelectionTurnScheduler::next_groups(aggregate);
            let pick = SelectionTurnScheduler::pick(aggregate, group_id, selections)?;
            let next = SelectionTurnScheduler::next_groups(aggregate);

            let newly_eligible: Vec<EligibleGroup> = next
                .iter()
                .filter(|head| !before.contains(head))
                .cloned()
                .collect();
            outbox.extend(selection_invites(aggregate, &newly_eligible));

            if next.is_empty() {
                aggregate.draw.advance(PhaseTransition::Finish)?;
            }
            Ok((pick, next))
        })?;

        info!(
            draw_id = %draw_id,
            group_id = %group_id,
            suites = pick.bound.len(),
            phase = %stored.phase(),
            "suite picked"
        );
        Ok(PickResult {
            draw_id: draw_id.clone(),
            phase: stored.phase(),
            pick,
            next,
        })
    }

    pub fn remove_suite(&self, draw_id: &DrawId, group_id: &GroupId) -> Result<SuiteId, DrawError> {
        let (suite_id, _) = self.write(draw_id, |aggregate, _| {
            SelectionTurnScheduler::remove_suite(aggregate, group_id)
        })?;
        info!(draw_id = %draw_id, group_id = %group_id, suite_id = %suite_id, "suite released");
        Ok(suite_id)
    }

    /// Queues intent or locking reminders. `today` is compared against the
    /// draw's deadlines and `now` is recorded as the send time.
    pub fn queue_reminder(
        &self,
        draw_id: &DrawId,
        kind: ReminderKind,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<ReminderOutcome, DrawError> {
        let (recipients, _) = self.write(draw_id, |aggregate, outbox| {
            let phase = aggregate.phase();
            if !phase.is_pre_lottery() {
                return Err(GuardViolation::WrongPhase {
                    action: DrawAction::QueueReminder,
                    phase,
                }
                .into());
            }

            let recipients = reminder_recipients(aggregate, kind, today)?;
            let notification = match kind {
                ReminderKind::Intent => NotificationKind::IntentReminder,
                ReminderKind::Locking => NotificationKind::LockingReminder,
            };
            let draw_id = aggregate.id().clone();
            outbox.extend(recipients.iter().map(|applicant| {
                NotificationEvent::to_applicant(notification, &draw_id, applicant)
            }));
            aggregate.draw.last_reminder = Some(ReminderRecord { kind, sent_at: now });
            Ok(recipients.len())
        })?;

        info!(draw_id = %draw_id, kind = kind.label(), recipients, "reminders queued");
        Ok(ReminderOutcome {
            draw_id: draw_id.clone(),
            kind,
            recipients,
            sent_at: now,
        })
    }

    pub fn ranking(&self, draw_id: &DrawId, group_id: &GroupId) -> Result<GroupRank, DrawError> {
        let aggregate = self.load(draw_id)?;
        GroupRegistry::new(&aggregate)
            .rank_of(group_id)
            .ok_or_else(|| {
                DrawError::invalid(format!(
                    "Group {group_id} is not part of this draw or has no lottery number."
                ))
            })
    }

    pub fn oversubscription(&self, draw_id: &DrawId) -> Result<Vec<SizeDemand>, DrawError> {
        let aggregate = self.load(draw_id)?;
        Ok(GroupRegistry::new(&aggregate).oversubscribed_sizes())
    }
}

fn applicant<'a>(aggregate: &'a DrawAggregate, id: &ApplicantId) -> Option<&'a Applicant> {
    aggregate
        .applicants
        .iter()
        .find(|applicant| &applicant.id == id)
}

/// Clips and unclipped groups that hold no number yet.
fn lottery_roster(aggregate: &DrawAggregate) -> Vec<RosterEntry> {
    let registry = GroupRegistry::new(aggregate);
    let mut roster = Vec::new();

    for clip in &aggregate.clips {
        let numbered = clip
            .groups
            .iter()
            .any(|group| registry.assignment_for(group).is_some());
        let size = clip
            .leader()
            .and_then(|leader| registry.group(leader))
            .map(|group| group.size);
        if let (false, Some(size)) = (numbered, size) {
            roster.push(RosterEntry {
                owner: LotteryOwner::Clip(clip.id.clone()),
                size,
                groups: clip.groups.clone(),
            });
        }
    }

    for group in registry.unnumbered_groups() {
        if registry.clip_of(&group.id).is_none() {
            roster.push(RosterEntry {
                owner: LotteryOwner::Group(group.id.clone()),
                size: group.size,
                groups: vec![group.id.clone()],
            });
        }
    }

    roster
}

/// One invite per unit, addressed to the leader of its reporting group.
fn selection_invites(aggregate: &DrawAggregate, eligible: &[EligibleGroup]) -> Vec<NotificationEvent> {
    let registry = GroupRegistry::new(aggregate);
    eligible
        .iter()
        .filter_map(|head| {
            let group = registry.group(&head.group_id)?;
            let leader = applicant(aggregate, &group.leader)?;
            Some(
                NotificationEvent::to_applicant(
                    NotificationKind::SelectionInvite,
                    aggregate.id(),
                    leader,
                )
                .for_group(&group.id),
            )
        })
        .collect()
}

/// One result per applicant in a numbered group, carrying their group's rank.
fn lottery_results(aggregate: &DrawAggregate) -> Vec<NotificationEvent> {
    let registry = GroupRegistry::new(aggregate);
    let mut events = Vec::new();
    for group in &aggregate.groups {
        let Some(rank) = registry.rank_of(&group.id) else {
            continue;
        };
        let detail = LotteryResultDetail {
            lottery_number: rank.lottery_number,
            group_size: rank.group_size,
            rank: rank.rank,
            total_in_size: rank.total_in_size,
        };
        for member in &group.members {
            if let Some(applicant) = applicant(aggregate, member) {
                events.push(
                    NotificationEvent::to_applicant(
                        NotificationKind::LotteryResult,
                        aggregate.id(),
                        applicant,
                    )
                    .for_group(&group.id)
                    .with_lottery(detail),
                );
            }
        }
    }
    events
}

fn reminder_recipients(
    aggregate: &DrawAggregate,
    kind: ReminderKind,
    today: NaiveDate,
) -> Result<Vec<Applicant>, DrawError> {
    let intent_deadline = aggregate.draw.intent_deadline;
    match kind {
        ReminderKind::Intent => {
            let deadline = intent_deadline
                .ok_or_else(|| DrawError::invalid("Draw has no intent deadline."))?;
            if today > deadline {
                return Err(DrawError::invalid(format!(
                    "The intent deadline {deadline} has passed."
                )));
            }
            let grouped: BTreeSet<&ApplicantId> = aggregate
                .groups
                .iter()
                .flat_map(|group| group.members.iter())
                .collect();
            Ok(aggregate
                .applicants
                .iter()
                .filter(|applicant| !grouped.contains(&applicant.id))
                .cloned()
                .collect())
        }
        ReminderKind::Locking => {
            if aggregate.draw.locking_deadline.is_none() {
                return Err(DrawError::invalid("Draw has no locking deadline."));
            }
            if let Some(deadline) = intent_deadline {
                if today <= deadline {
                    return Err(DrawError::invalid(format!(
                        "Locking reminders start after the intent deadline {deadline}."
                    )));
                }
            }
            Ok(aggregate
                .groups
                .iter()
                .filter(|group| group.status != GroupStatus::Locked)
                .filter_map(|group| applicant(aggregate, &group.leader))
                .cloned()
                .collect())
        }
    }
}
