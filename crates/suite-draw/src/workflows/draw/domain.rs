use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::error::GuardViolation;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of one allocation instance.
    DrawId
);
string_id!(GroupId);
string_id!(ClipId);
string_id!(SuiteId);
string_id!(ApplicantId);
string_id!(LotteryId);

/// Bed count of a suite, and the target size of a group.
pub type SuiteSize = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreLotteryStage {
    IntentSelection,
    GroupFormation,
}

/// Closed set of draw phases. Only [`PhaseTransition::apply`] produces a new phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawPhase {
    Draft,
    PreLottery(PreLotteryStage),
    Lottery,
    SuiteSelection,
    Results,
}

impl DrawPhase {
    pub const fn ordered() -> [Self; 6] {
        [
            Self::Draft,
            Self::PreLottery(PreLotteryStage::IntentSelection),
            Self::PreLottery(PreLotteryStage::GroupFormation),
            Self::Lottery,
            Self::SuiteSelection,
            Self::Results,
        ]
    }

    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::PreLottery(PreLotteryStage::IntentSelection) => 1,
            Self::PreLottery(PreLotteryStage::GroupFormation) => 2,
            Self::Lottery => 3,
            Self::SuiteSelection => 4,
            Self::Results => 5,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PreLottery(PreLotteryStage::IntentSelection) => "intent_selection",
            Self::PreLottery(PreLotteryStage::GroupFormation) => "group_formation",
            Self::Lottery => "lottery",
            Self::SuiteSelection => "suite_selection",
            Self::Results => "results",
        }
    }

    pub const fn is_pre_lottery(self) -> bool {
        matches!(self, Self::PreLottery(_))
    }

    /// Groups may still join or leave the draw.
    pub const fn before_selection(self) -> bool {
        matches!(self, Self::PreLottery(_) | Self::Lottery)
    }
}

impl fmt::Display for DrawPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Every mutating or phase-scoped operation, for guard reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawAction {
    Activate,
    ProceedToGroupFormation,
    StartLottery,
    StartSelection,
    Finish,
    AssignLotteryNumber,
    RetractLotteryNumber,
    Prune,
    WithdrawGroup,
    ListNextGroups,
    PickSuite,
    RemoveSuite,
    QueueReminder,
}

impl DrawAction {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Activate => "activate the draw",
            Self::ProceedToGroupFormation => "proceed to group formation",
            Self::StartLottery => "start the lottery",
            Self::StartSelection => "start suite selection",
            Self::Finish => "finish suite selection",
            Self::AssignLotteryNumber => "assign lottery numbers",
            Self::RetractLotteryNumber => "retract lottery numbers",
            Self::Prune => "prune oversubscribed sizes",
            Self::WithdrawGroup => "withdraw groups",
            Self::ListNextGroups => "list the groups selecting next",
            Self::PickSuite => "pick suites",
            Self::RemoveSuite => "remove suite assignments",
            Self::QueueReminder => "send reminders",
        }
    }
}

/// The valid edges of the phase graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Activate,
    ProceedToGroupFormation,
    StartLottery,
    StartSelection,
    Finish,
}

impl PhaseTransition {
    pub const fn action(self) -> DrawAction {
        match self {
            Self::Activate => DrawAction::Activate,
            Self::ProceedToGroupFormation => DrawAction::ProceedToGroupFormation,
            Self::StartLottery => DrawAction::StartLottery,
            Self::StartSelection => DrawAction::StartSelection,
            Self::Finish => DrawAction::Finish,
        }
    }

    pub const fn apply(self, from: DrawPhase) -> Option<DrawPhase> {
        match (self, from) {
            (Self::Activate, DrawPhase::Draft) => {
                Some(DrawPhase::PreLottery(PreLotteryStage::IntentSelection))
            }
            (
                Self::ProceedToGroupFormation,
                DrawPhase::PreLottery(PreLotteryStage::IntentSelection),
            ) => Some(DrawPhase::PreLottery(PreLotteryStage::GroupFormation)),
            (Self::StartLottery, DrawPhase::PreLottery(_)) => Some(DrawPhase::Lottery),
            (Self::StartSelection, DrawPhase::Lottery) => Some(DrawPhase::SuiteSelection),
            (Self::Finish, DrawPhase::SuiteSelection) => Some(DrawPhase::Results),
            _ => None,
        }
    }

    /// Target phase, or the guard violation reported when `from` has no such edge.
    pub fn check(self, from: DrawPhase) -> Result<DrawPhase, GuardViolation> {
        self.apply(from).ok_or(GuardViolation::WrongPhase {
            action: self.action(),
            phase: from,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    Intent,
    Locking,
}

impl ReminderKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Locking => "locking",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub kind: ReminderKind,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draw {
    pub id: DrawId,
    pub name: String,
    phase: DrawPhase,
    pub intent_deadline: Option<NaiveDate>,
    pub locking_deadline: Option<NaiveDate>,
    pub last_reminder: Option<ReminderRecord>,
}

impl Draw {
    pub fn new(id: DrawId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            phase: DrawPhase::Draft,
            intent_deadline: None,
            locking_deadline: None,
            last_reminder: None,
        }
    }

    pub fn with_deadlines(mut self, intent: Option<NaiveDate>, locking: Option<NaiveDate>) -> Self {
        self.intent_deadline = intent;
        self.locking_deadline = locking;
        self
    }

    pub fn phase(&self) -> DrawPhase {
        self.phase
    }

    pub(crate) fn advance(&mut self, transition: PhaseTransition) -> Result<DrawPhase, GuardViolation> {
        let next = transition.check(self.phase)?;
        self.phase = next;
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicant {
    pub id: ApplicantId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Open,
    Full,
    Finalizing,
    Locked,
}

impl GroupStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Full => "full",
            Self::Finalizing => "finalizing",
            Self::Locked => "locked",
        }
    }
}

/// Applicants bonded to share one suite. The suite link lives on [`Suite::group`]
/// and the lottery number on the covering [`LotteryAssignment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub leader: ApplicantId,
    pub members: Vec<ApplicantId>,
    pub size: SuiteSize,
    pub status: GroupStatus,
    pub draw: Option<DrawId>,
    pub formed_at: DateTime<Utc>,
}

/// Groups sharing one lottery number. The first group leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub id: ClipId,
    pub draw: DrawId,
    pub groups: Vec<GroupId>,
}

impl Clip {
    pub fn leader(&self) -> Option<&GroupId> {
        self.groups.first()
    }

    pub fn contains(&self, group: &GroupId) -> bool {
        self.groups.iter().any(|member| member == group)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suite {
    pub id: SuiteId,
    pub number: String,
    pub size: SuiteSize,
    pub group: Option<GroupId>,
}

/// The entity a lottery number belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotteryOwner {
    Group(GroupId),
    Clip(ClipId),
}

impl LotteryOwner {
    /// The owning group, or `None` when the number is shared by a clip.
    pub fn single_group(&self) -> Option<&GroupId> {
        match self {
            Self::Group(group) => Some(group),
            Self::Clip(_) => None,
        }
    }
}

impl fmt::Display for LotteryOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(group) => write!(f, "group {group}"),
            Self::Clip(clip) => write!(f, "clip {clip}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryAssignment {
    pub id: LotteryId,
    draw: DrawId,
    pub number: u32,
    pub owner: LotteryOwner,
    selected: bool,
}

impl LotteryAssignment {
    pub fn new(draw: DrawId, number: u32, owner: LotteryOwner) -> Self {
        Self {
            id: LotteryId(format!("{draw}-lottery-{number}")),
            draw,
            number,
            owner,
            selected: false,
        }
    }

    pub fn draw(&self) -> &DrawId {
        &self.draw
    }

    pub fn selected(&self) -> bool {
        self.selected
    }

    pub(crate) fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
    }
}

/// Everything scoped to one draw; the unit of persistence and of atomic commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawAggregate {
    pub draw: Draw,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub applicants: Vec<Applicant>,
    #[serde(default)]
    pub suites: Vec<Suite>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub lottery: Vec<LotteryAssignment>,
}

impl DrawAggregate {
    pub fn new(draw: Draw) -> Self {
        Self {
            draw,
            version: 0,
            applicants: Vec::new(),
            suites: Vec::new(),
            groups: Vec::new(),
            clips: Vec::new(),
            lottery: Vec::new(),
        }
    }

    pub fn id(&self) -> &DrawId {
        &self.draw.id
    }

    pub fn phase(&self) -> DrawPhase {
        self.draw.phase()
    }

    /// Checks the cross-record rules a repository must enforce before storing.
    pub fn check_invariants(&self) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();
        let draw_id = self.id();

        let mut group_ids = BTreeSet::new();
        for group in &self.groups {
            if !group_ids.insert(&group.id) {
                violations.push(format!("group {} appears more than once", group.id));
            }
            if group.draw.as_ref() != Some(draw_id) {
                violations.push(format!("group {} is not scoped to draw {draw_id}", group.id));
            }
            if group.size == 0 {
                violations.push(format!("group {} has no size", group.id));
            }
        }

        let mut suite_ids = BTreeSet::new();
        let mut housed: BTreeMap<&GroupId, &SuiteId> = BTreeMap::new();
        for suite in &self.suites {
            if !suite_ids.insert(&suite.id) {
                violations.push(format!("suite {} appears more than once", suite.id));
            }
            let Some(group_id) = &suite.group else {
                continue;
            };
            if let Some(previous) = housed.insert(group_id, &suite.id) {
                violations.push(format!(
                    "group {group_id} holds both suite {previous} and suite {}",
                    suite.id
                ));
            }
            match self.groups.iter().find(|group| &group.id == group_id) {
                Some(group) if group.size != suite.size => violations.push(format!(
                    "group {group_id} of size {} cannot hold suite {} of size {}",
                    group.size, suite.id, suite.size
                )),
                Some(_) => {}
                None => violations.push(format!(
                    "suite {} is assigned to group {group_id} outside the draw",
                    suite.id
                )),
            }
        }

        let mut clipped = BTreeSet::new();
        for clip in &self.clips {
            if &clip.draw != draw_id {
                violations.push(format!("clip {} is not scoped to draw {draw_id}", clip.id));
            }
            if clip.groups.is_empty() {
                violations.push(format!("clip {} has no groups", clip.id));
            }
            for group_id in &clip.groups {
                if !group_ids.contains(group_id) {
                    violations.push(format!(
                        "clip {} references group {group_id} outside the draw",
                        clip.id
                    ));
                }
                if !clipped.insert(group_id) {
                    violations.push(format!("group {group_id} belongs to more than one clip"));
                }
            }
        }

        let mut numbers = BTreeSet::new();
        let mut covered = BTreeSet::new();
        for assignment in &self.lottery {
            if assignment.draw() != draw_id {
                violations.push(format!(
                    "lottery assignment {} belongs to draw {}",
                    assignment.id,
                    assignment.draw()
                ));
            }
            if assignment.number == 0 {
                violations.push(format!("lottery assignment {} has number 0", assignment.id));
            }
            if !numbers.insert(assignment.number) {
                violations.push(format!(
                    "lottery number {} is used more than once",
                    assignment.number
                ));
            }
            let groups: Vec<&GroupId> = match &assignment.owner {
                LotteryOwner::Group(group_id) => vec![group_id],
                LotteryOwner::Clip(clip_id) => {
                    match self.clips.iter().find(|clip| &clip.id == clip_id) {
                        Some(clip) => clip.groups.iter().collect(),
                        None => {
                            violations.push(format!(
                                "lottery assignment {} references unknown clip {clip_id}",
                                assignment.id
                            ));
                            Vec::new()
                        }
                    }
                }
            };
            for group_id in groups {
                if !covered.insert(group_id) {
                    violations.push(format!(
                        "group {group_id} holds more than one lottery assignment"
                    ));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
