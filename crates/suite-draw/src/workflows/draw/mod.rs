//! Suite draw allocation: phases, lottery numbering, selection turns and
//! oversubscription pruning for one housing draw at a time.

pub mod domain;
mod error;
mod lifecycle;
pub mod lottery;
pub mod notifications;
pub mod pruning;
pub mod registry;
pub mod repository;
pub mod router;
pub mod selection;

#[cfg(test)]
mod tests;

pub use domain::{
    Applicant, ApplicantId, Clip, ClipId, Draw, DrawAction, DrawAggregate, DrawId, DrawPhase,
    Group, GroupId, GroupStatus, LotteryAssignment, LotteryId, LotteryOwner, PhaseTransition,
    PreLotteryStage, ReminderKind, ReminderRecord, Suite, SuiteId, SuiteSize,
};
pub use error::{DrawError, FailureKind, GuardViolation};
pub use lifecycle::{
    DrawLifecycle, LotteryStartOutcome, PhaseOutcome, PickResult, ReminderOutcome, RosterEntry,
    SelectionStartOutcome,
};
pub use lottery::LotteryAssignmentEngine;
pub use notifications::{
    DispatchReport, LotteryResultDetail, NotificationDispatcher, NotificationEvent,
    NotificationKind, NotificationPayload, NotificationPublisher, NotifyError, OutboxEntry,
};
pub use pruning::{OversubscriptionPruner, PruneOutcome, PruneTarget};
pub use registry::{GroupRank, GroupRegistry, SizeDemand};
pub use repository::{DrawCommit, DrawRepository, RepositoryError};
pub use router::draw_router;
pub use selection::{EligibleGroup, PickOutcome, SelectionTurnScheduler, SuiteSelection};
