use std::sync::Arc;

use chrono::NaiveDate;

use super::common::*;
use crate::workflows::draw::domain::{
    DrawAggregate, DrawPhase, GroupId, GroupStatus, LotteryAssignment, LotteryOwner,
    PreLotteryStage, ReminderKind,
};
use crate::workflows::draw::notifications::NotificationKind;
use crate::workflows::draw::repository::DrawRepository;
use crate::workflows::draw::{DrawError, DrawLifecycle, FailureKind, GuardViolation};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2027, 2, day).expect("valid date")
}

#[test]
fn activation_rejects_fewer_beds_than_applicants() {
    let draft = DrawFixture::new().loose_applicants(3).suites(2, 1).build();
    let (lifecycle, repository) = build_lifecycle(draft);

    let err = lifecycle
        .activate(&draw_id())
        .expect_err("two beds cannot house three applicants");

    assert_eq!(err.kind(), FailureKind::ValidationFailure);
    assert!(err.messages()[0].contains("at least one bed per applicant"));
    assert_eq!(repository.stored(&draw_id()).phase(), DrawPhase::Draft);
    assert_eq!(repository.commit_count(), 0);
    assert!(repository.events().is_empty());
}

#[test]
fn activation_opens_intent_selection_and_invites_everyone() {
    let draft = DrawFixture::new().loose_applicants(3).suites(1, 3).build();
    let (lifecycle, repository) = build_lifecycle(draft);

    let outcome = lifecycle.activate(&draw_id()).expect("three beds suffice");

    assert_eq!(outcome.phase, intent_selection());
    assert_eq!(outcome.notifications, 3);
    assert_eq!(
        repository.events_of(NotificationKind::DrawInvitation).len(),
        3
    );
    assert_eq!(repository.stored(&draw_id()).version, 1);
}

#[test]
fn activation_without_applicants_fails_validation() {
    let draft = DrawFixture::new().suites(2, 2).build();
    let (lifecycle, _) = build_lifecycle(draft);

    let err = lifecycle.activate(&draw_id()).expect_err("empty draw");

    assert_eq!(
        err.messages(),
        vec!["Draw must have at least one applicant.".to_string()]
    );
}

#[test]
fn second_activation_is_a_guard_violation() {
    let draft = DrawFixture::new().loose_applicants(1).suites(1, 1).build();
    let (lifecycle, _) = build_lifecycle(draft);
    lifecycle.activate(&draw_id()).expect("first activation");

    let err = lifecycle.activate(&draw_id()).expect_err("already active");

    assert!(matches!(
        err,
        DrawError::Guard(GuardViolation::WrongPhase { phase, .. }) if phase == intent_selection()
    ));
}

#[test]
fn unknown_draws_are_not_found() {
    let (lifecycle, _) = build_lifecycle(DrawFixture::new().build());

    let err = lifecycle
        .activate(&crate::workflows::draw::DrawId::new("missing"))
        .expect_err("no such draw");

    assert_eq!(err.kind(), FailureKind::NotFound);
}

#[test]
fn group_formation_follows_intent_selection() {
    let draw = DrawFixture::new()
        .group("g1", 2)
        .suites(2, 1)
        .phase(intent_selection())
        .build();
    let (lifecycle, _) = build_lifecycle(draw);

    let outcome = lifecycle
        .proceed_to_group_formation(&draw_id())
        .expect("intent selection moves on");
    assert_eq!(
        outcome.phase,
        DrawPhase::PreLottery(PreLotteryStage::GroupFormation)
    );

    let err = lifecycle
        .proceed_to_group_formation(&draw_id())
        .expect_err("only once");
    assert_eq!(err.kind(), FailureKind::GuardViolation);
}

#[test]
fn start_lottery_discards_stale_numbers_and_lists_the_roster() {
    let mut draw = DrawFixture::new()
        .group("g1", 2)
        .group("g2", 2)
        .group("g3", 1)
        .suites(2, 2)
        .suites(1, 1)
        .clip("c1", &["g1", "g2"])
        .phase(intent_selection())
        .build();
    draw.lottery.push(LotteryAssignment::new(
        draw_id(),
        9,
        LotteryOwner::Group(GroupId::new("dissolved")),
    ));
    let (lifecycle, repository) = build_lifecycle(draw);

    let outcome = lifecycle.start_lottery(&draw_id()).expect("lottery opens");

    assert_eq!(outcome.phase, DrawPhase::Lottery);
    assert_eq!(outcome.discarded, 1);
    let owners: Vec<LotteryOwner> = outcome
        .roster
        .iter()
        .map(|entry| entry.owner.clone())
        .collect();
    assert_eq!(
        owners,
        vec![
            LotteryOwner::Clip(crate::workflows::draw::ClipId::new("c1")),
            LotteryOwner::Group(GroupId::new("g3")),
        ]
    );
    assert!(repository.stored(&draw_id()).lottery.is_empty());
}

#[test]
fn start_lottery_outside_pre_lottery_is_rejected() {
    let (lifecycle, _) = build_lifecycle(DrawFixture::new().loose_applicants(1).build());

    let err = lifecycle.start_lottery(&draw_id()).expect_err("still draft");

    assert_eq!(err.kind(), FailureKind::GuardViolation);
}

fn lottery_with_unnumbered_group() -> DrawAggregate {
    DrawFixture::new()
        .group("g1", 2)
        .group("g2", 2)
        .suites(2, 2)
        .phase(DrawPhase::Lottery)
        .number(1, "g1")
        .build()
}

#[test]
fn selection_waits_for_every_group_to_be_numbered() {
    let (lifecycle, repository) = build_lifecycle(lottery_with_unnumbered_group());

    let err = lifecycle
        .start_selection(&draw_id())
        .expect_err("g2 has no number");
    match &err {
        DrawError::Guard(violation) => {
            assert_eq!(violation.reason(), "lottery_incomplete");
            assert_eq!(
                violation,
                &GuardViolation::LotteryIncomplete { unnumbered: 1 }
            );
        }
        other => panic!("expected guard violation, got {other:?}"),
    }
    assert_eq!(repository.stored(&draw_id()).phase(), DrawPhase::Lottery);

    lifecycle
        .assign_lottery_number(&draw_id(), 2, LotteryOwner::Group(GroupId::new("g2")))
        .expect("g2 numbered");
    let outcome = lifecycle
        .start_selection(&draw_id())
        .expect("every group numbered");
    assert_eq!(outcome.phase, DrawPhase::SuiteSelection);
}

#[test]
fn selection_starts_once_the_unnumbered_group_withdraws() {
    let (lifecycle, _) = build_lifecycle(lottery_with_unnumbered_group());
    assert!(lifecycle.start_selection(&draw_id()).is_err());

    lifecycle
        .withdraw_group(&draw_id(), &GroupId::new("g2"))
        .expect("withdrawal allowed during lottery");

    let outcome = lifecycle
        .start_selection(&draw_id())
        .expect("remaining group numbered");
    assert_eq!(outcome.phase, DrawPhase::SuiteSelection);
    assert_eq!(outcome.eligible.len(), 1);
}

#[test]
fn selection_from_the_wrong_phase_names_the_phase() {
    let draw = DrawFixture::new()
        .group("g1", 1)
        .suites(1, 1)
        .phase(intent_selection())
        .build();
    let (lifecycle, _) = build_lifecycle(draw);

    let err = lifecycle.start_selection(&draw_id()).expect_err("not lottery");

    match err {
        DrawError::Guard(violation) => assert_eq!(violation.reason(), "wrong_phase"),
        other => panic!("expected guard violation, got {other:?}"),
    }
}

#[test]
fn selection_start_reclaims_numbers_of_withdrawn_groups() {
    let draw = DrawFixture::new()
        .group("g1", 2)
        .group("g2", 2)
        .suites(2, 2)
        .phase(DrawPhase::Lottery)
        .number(1, "g1")
        .number(2, "g2")
        .build();
    let (lifecycle, repository) = build_lifecycle(draw);
    lifecycle
        .withdraw_group(&draw_id(), &GroupId::new("g1"))
        .expect("g1 dissolves");
    assert_eq!(repository.stored(&draw_id()).lottery.len(), 2);

    let outcome = lifecycle.start_selection(&draw_id()).expect("selection");

    assert_eq!(outcome.reclaimed, 1);
    let stored = repository.stored(&draw_id());
    assert_eq!(stored.lottery.len(), 1);
    assert_eq!(stored.lottery[0].number, 2);
}

#[test]
fn selection_with_no_pickable_unit_goes_straight_to_results() {
    let draw = DrawFixture::new()
        .group("a", 3)
        .suites(2, 1)
        .phase(DrawPhase::Lottery)
        .number(1, "a")
        .build();
    let (lifecycle, repository) = build_lifecycle(draw);

    let outcome = lifecycle
        .start_selection(&draw_id())
        .expect("selection starts");

    assert_eq!(outcome.phase, DrawPhase::Results);
    assert!(outcome.eligible.is_empty());
    assert!(outcome.lottery_results > 0);
    assert_eq!(repository.stored(&draw_id()).phase(), DrawPhase::Results);
    assert!(repository
        .events_of(NotificationKind::SelectionInvite)
        .is_empty());

    let err = lifecycle.next_groups(&draw_id()).expect_err("draw finished");
    assert_eq!(err.kind(), FailureKind::GuardViolation);
}

#[test]
fn selection_without_groups_finishes_immediately() {
    let draw = DrawFixture::new()
        .loose_applicants(2)
        .suites(1, 2)
        .phase(DrawPhase::Lottery)
        .build();
    let (lifecycle, repository) = build_lifecycle(draw);

    let outcome = lifecycle
        .start_selection(&draw_id())
        .expect("nothing to number");

    assert_eq!(outcome.phase, DrawPhase::Results);
    assert_eq!(outcome.lottery_results, 0);
    assert_eq!(repository.stored(&draw_id()).phase(), DrawPhase::Results);
}

#[test]
fn selection_start_sends_invites_and_ranked_results() {
    let draw = DrawFixture::new()
        .group("a", 2)
        .group("b", 2)
        .group("c", 2)
        .group("d", 4)
        .suites(2, 3)
        .suites(4, 1)
        .phase(DrawPhase::Lottery)
        .number(3, "a")
        .number(1, "b")
        .number(5, "c")
        .number(2, "d")
        .build();
    let (lifecycle, repository) = build_lifecycle(draw);

    let outcome = lifecycle.start_selection(&draw_id()).expect("selection");

    assert_eq!(outcome.lottery_results, 10);
    let invites = repository.events_of(NotificationKind::SelectionInvite);
    let invited: Vec<String> = invites
        .iter()
        .map(|event| event.payload.recipient.to_string())
        .collect();
    assert_eq!(invited, vec!["b-m0".to_string(), "d-m0".to_string()]);

    let results = repository.events_of(NotificationKind::LotteryResult);
    let for_c = results
        .iter()
        .find(|event| event.payload.recipient.as_str() == "c-m1")
        .and_then(|event| event.payload.lottery)
        .expect("c members get results");
    assert_eq!(for_c.rank, 3);
    assert_eq!(for_c.total_in_size, 3);
    assert_eq!(for_c.group_size, 2);
    assert_eq!(for_c.lottery_number, 5);
}

#[test]
fn refreshing_an_unchanged_flag_writes_nothing() {
    let draw = DrawFixture::new()
        .group("g1", 1)
        .group("g2", 1)
        .suites(1, 2)
        .phase(DrawPhase::SuiteSelection)
        .number(1, "g1")
        .number(2, "g2")
        .housed("g1", "s1-1")
        .build();
    let lottery_id = draw.lottery[0].id.clone();
    let (lifecycle, repository) = build_lifecycle(draw);

    assert!(lifecycle
        .refresh_selected(&draw_id(), &lottery_id)
        .expect("first refresh"));
    assert_eq!(repository.commit_count(), 1);
    let version = repository.stored(&draw_id()).version;

    assert!(!lifecycle
        .refresh_selected(&draw_id(), &lottery_id)
        .expect("second refresh"));
    assert_eq!(repository.commit_count(), 1);
    let stored = repository.stored(&draw_id());
    assert_eq!(stored.version, version);
    assert!(stored.lottery[0].selected());
}

#[test]
fn intent_reminders_reach_applicants_without_a_group() {
    let draw = DrawFixture::new()
        .group("g1", 2)
        .loose_applicants(2)
        .suites(2, 2)
        .deadlines(Some(date(10)), Some(date(20)))
        .phase(intent_selection())
        .build();
    let (lifecycle, repository) = build_lifecycle(draw);
    let now = formed_at(30);

    let outcome = lifecycle
        .queue_reminder(&draw_id(), ReminderKind::Intent, date(9), now)
        .expect("before the intent deadline");

    assert_eq!(outcome.recipients, 2);
    assert_eq!(repository.events_of(NotificationKind::IntentReminder).len(), 2);
    let reminder = repository
        .stored(&draw_id())
        .draw
        .last_reminder
        .expect("reminder recorded");
    assert_eq!(reminder.kind, ReminderKind::Intent);
    assert_eq!(reminder.sent_at, now);

    let err = lifecycle
        .queue_reminder(&draw_id(), ReminderKind::Intent, date(11), now)
        .expect_err("deadline passed");
    assert_eq!(err.kind(), FailureKind::ValidationFailure);
}

#[test]
fn locking_reminders_wait_for_the_intent_deadline() {
    let draw = DrawFixture::new()
        .group("g1", 2)
        .group("g2", 2)
        .status("g2", GroupStatus::Full)
        .suites(2, 2)
        .deadlines(Some(date(10)), Some(date(20)))
        .phase(intent_selection())
        .build();
    let (lifecycle, repository) = build_lifecycle(draw);

    assert!(lifecycle
        .queue_reminder(&draw_id(), ReminderKind::Locking, date(10), formed_at(1))
        .is_err());

    let outcome = lifecycle
        .queue_reminder(&draw_id(), ReminderKind::Locking, date(11), formed_at(2))
        .expect("after the intent deadline");
    assert_eq!(outcome.recipients, 1);
    let events = repository.events_of(NotificationKind::LockingReminder);
    assert_eq!(events[0].payload.recipient.as_str(), "g2-m0");
}

#[test]
fn reminders_outside_pre_lottery_are_rejected() {
    let draw = DrawFixture::new()
        .loose_applicants(1)
        .deadlines(Some(date(10)), None)
        .build();
    let (lifecycle, _) = build_lifecycle(draw);

    let err = lifecycle
        .queue_reminder(&draw_id(), ReminderKind::Intent, date(1), formed_at(1))
        .expect_err("draft draws send nothing");
    assert_eq!(err.kind(), FailureKind::GuardViolation);
}

#[test]
fn open_draw_enforces_invariants_and_uniqueness() {
    let repository = Arc::new(MemoryDrawRepository::default());
    let lifecycle = DrawLifecycle::new(repository);

    let broken = DrawFixture::new()
        .group("g1", 1)
        .clip("c1", &["g1"])
        .clip("c2", &["g1"])
        .build();
    let err = lifecycle.open_draw(broken).expect_err("group in two clips");
    assert_eq!(err.kind(), FailureKind::ValidationFailure);

    let mut seeded = DrawFixture::new()
        .group("g1", 1)
        .suites(1, 1)
        .housed("g1", "s1-1")
        .number(7, "g1")
        .build();
    seeded.version = 3;
    let err = lifecycle
        .open_draw(seeded)
        .expect_err("drafts start without picks or numbers");
    assert_eq!(err.kind(), FailureKind::ValidationFailure);
    let messages = err.messages();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().any(|message| message.contains("version 0")));
    assert!(messages.iter().any(|message| message.contains("s1-1")));
    assert!(messages
        .iter()
        .any(|message| message.contains("Lottery numbers cannot be issued")));
    assert_eq!(
        lifecycle.draw(&draw_id()).expect_err("not stored").kind(),
        FailureKind::NotFound
    );

    let draft = DrawFixture::new().loose_applicants(1).build();
    lifecycle.open_draw(draft.clone()).expect("first open");
    let err = lifecycle.open_draw(draft).expect_err("duplicate id");
    assert_eq!(err.kind(), FailureKind::ValidationFailure);
}

#[test]
fn persistence_failures_leave_the_draw_untouched() {
    let repository = Arc::new(UnavailableRepository {
        inner: MemoryDrawRepository::default(),
    });
    let draft = DrawFixture::new().loose_applicants(1).suites(1, 1).build();
    repository.insert(draft).expect("seeded");
    let lifecycle = DrawLifecycle::new(repository.clone());

    let err = lifecycle.activate(&draw_id()).expect_err("commit fails");

    assert_eq!(err.kind(), FailureKind::Persistence);
    assert!(!err.is_retryable());
    assert_eq!(
        repository.inner.stored(&draw_id()).phase(),
        DrawPhase::Draft
    );
    assert!(repository.inner.events().is_empty());
}
