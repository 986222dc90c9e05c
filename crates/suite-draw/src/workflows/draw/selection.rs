//! Selection turns. A turn unit is one lottery assignment: a single group, or
//! every group of a clip picking together under the clip leader. Each size has
//! its own queue ordered by ascending lottery number.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::domain::{
    ClipId, DrawAction, DrawAggregate, DrawPhase, Group, GroupId, LotteryAssignment, LotteryId,
    LotteryOwner, SuiteId, SuiteSize,
};
use super::error::{DrawError, GuardViolation};
use super::lottery::LotteryAssignmentEngine;
use super::registry::GroupRegistry;

/// One suite chosen for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSelection {
    pub group_id: GroupId,
    pub suite_id: SuiteId,
}

/// The unit at the head of one size queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibleGroup {
    pub size: SuiteSize,
    /// The reporting group; for a clip, its leader.
    pub group_id: GroupId,
    pub lottery_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip: Option<ClipId>,
    /// Every group that must be housed by this pick.
    pub members: Vec<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PickOutcome {
    pub lottery_id: LotteryId,
    pub bound: Vec<SuiteSelection>,
}

struct TurnUnit<'a> {
    assignment: &'a LotteryAssignment,
    pending: Vec<&'a Group>,
}

impl TurnUnit<'_> {
    fn reporting(&self) -> &Group {
        self.pending[0]
    }

    fn size(&self) -> SuiteSize {
        self.reporting().size
    }

    fn demand(&self) -> BTreeMap<SuiteSize, usize> {
        let mut demand = BTreeMap::new();
        for group in &self.pending {
            *demand.entry(group.size).or_insert(0) += 1;
        }
        demand
    }

    fn fits(&self, available: &BTreeMap<SuiteSize, usize>) -> bool {
        self.demand()
            .iter()
            .all(|(size, needed)| available.get(size).copied().unwrap_or(0) >= *needed)
    }

    fn eligible(&self) -> EligibleGroup {
        EligibleGroup {
            size: self.size(),
            group_id: self.reporting().id.clone(),
            lottery_number: self.assignment.number,
            clip: match &self.assignment.owner {
                LotteryOwner::Clip(clip) => Some(clip.clone()),
                LotteryOwner::Group(_) => None,
            },
            members: self.pending.iter().map(|group| group.id.clone()).collect(),
        }
    }
}

/// Units that still have unhoused groups, best number first.
fn pending_units<'a>(aggregate: &'a DrawAggregate) -> Vec<TurnUnit<'a>> {
    let registry = GroupRegistry::new(aggregate);
    let mut units: Vec<TurnUnit<'a>> = aggregate
        .lottery
        .iter()
        .filter_map(|assignment| {
            let pending: Vec<&Group> = registry
                .covered_groups(assignment)
                .into_iter()
                .filter(|group| !registry.is_housed(&group.id))
                .collect();
            (!pending.is_empty()).then_some(TurnUnit {
                assignment,
                pending,
            })
        })
        .collect();
    units.sort_by_key(|unit| unit.assignment.number);
    units
}

pub struct SelectionTurnScheduler;

impl SelectionTurnScheduler {
    /// Head of every size queue that still has an available suite. A unit
    /// that cannot be housed entirely from what is left is passed over.
    pub fn next_groups(aggregate: &DrawAggregate) -> Vec<EligibleGroup> {
        let available = GroupRegistry::new(aggregate).available_by_size();
        let mut heads: BTreeMap<SuiteSize, EligibleGroup> = BTreeMap::new();

        for unit in pending_units(aggregate) {
            let size = unit.size();
            if heads.contains_key(&size) || !available.contains_key(&size) {
                continue;
            }
            if unit.fits(&available) {
                heads.insert(size, unit.eligible());
            }
        }

        heads.into_values().collect()
    }

    /// Binds suites for the unit reported by `group_id`. Clips are bound all
    /// at once or not at all.
    pub fn pick(
        aggregate: &mut DrawAggregate,
        group_id: &GroupId,
        selections: &[SuiteSelection],
    ) -> Result<PickOutcome, DrawError> {
        let phase = aggregate.phase();
        if phase != DrawPhase::SuiteSelection {
            return Err(GuardViolation::WrongPhase {
                action: DrawAction::PickSuite,
                phase,
            }
            .into());
        }

        let lottery_id = Self::check_turn(aggregate, group_id)?;
        let bound = Self::check_selections(aggregate, &lottery_id, selections)?;

        for selection in &bound {
            if let Some(suite) = aggregate
                .suites
                .iter_mut()
                .find(|suite| suite.id == selection.suite_id)
            {
                suite.group = Some(selection.group_id.clone());
            }
        }
        LotteryAssignmentEngine::recompute_selected(aggregate, &lottery_id);

        Ok(PickOutcome { lottery_id, bound })
    }

    fn check_turn(aggregate: &DrawAggregate, group_id: &GroupId) -> Result<LotteryId, DrawError> {
        let registry = GroupRegistry::new(aggregate);
        let group = registry
            .group(group_id)
            .ok_or_else(|| DrawError::invalid(format!("Group {group_id} is not part of this draw.")))?;
        if let Some(suite) = registry.suite_for(group_id) {
            return Err(DrawError::invalid(format!(
                "Group {group_id} already holds suite {}.",
                suite.number
            )));
        }
        let assignment = registry.assignment_for(group_id).ok_or_else(|| {
            DrawError::invalid(format!("Group {group_id} has no lottery number."))
        })?;

        let units = pending_units(aggregate);
        let unit = units
            .iter()
            .find(|unit| unit.assignment.id == assignment.id)
            .ok_or_else(|| DrawError::invalid(format!("Group {group_id} has nothing left to pick.")))?;
        if &unit.reporting().id != group_id {
            return Err(DrawError::invalid(format!(
                "Group {group_id} picks with its clip; group {} selects for it.",
                unit.reporting().id
            )));
        }

        let size = group.size;
        match Self::next_groups(aggregate)
            .into_iter()
            .find(|eligible| eligible.size == size)
        {
            Some(head) if &head.group_id == group_id => Ok(assignment.id.clone()),
            Some(head) if head.lottery_number < assignment.number => {
                Err(DrawError::StaleEligibility {
                    group: group_id.clone(),
                    size,
                    ahead: head.lottery_number,
                })
            }
            Some(_) => Err(DrawError::Conflict(format!(
                "Not enough suites remain to house every group picking with {group_id}."
            ))),
            None => Err(DrawError::Conflict(format!(
                "No suites of size {size} remain available."
            ))),
        }
    }

    fn check_selections(
        aggregate: &DrawAggregate,
        lottery_id: &LotteryId,
        selections: &[SuiteSelection],
    ) -> Result<Vec<SuiteSelection>, DrawError> {
        let units = pending_units(aggregate);
        let Some(unit) = units
            .iter()
            .find(|unit| &unit.assignment.id == lottery_id)
        else {
            return Err(DrawError::invalid("The picking unit has no groups left to house."));
        };

        let mut problems = Vec::new();
        let mut conflicts = Vec::new();
        let mut seen_groups = BTreeSet::new();
        let mut seen_suites = BTreeSet::new();

        for selection in selections {
            let Some(group) = unit
                .pending
                .iter()
                .find(|group| group.id == selection.group_id)
            else {
                problems.push(format!(
                    "Group {} is not picking in this turn.",
                    selection.group_id
                ));
                continue;
            };
            if !seen_groups.insert(&selection.group_id) {
                problems.push(format!(
                    "Group {} was given more than one suite.",
                    selection.group_id
                ));
            }
            if !seen_suites.insert(&selection.suite_id) {
                problems.push(format!(
                    "Suite {} was picked more than once.",
                    selection.suite_id
                ));
            }
            match aggregate
                .suites
                .iter()
                .find(|suite| suite.id == selection.suite_id)
            {
                None => problems.push(format!(
                    "Suite {} is not part of this draw.",
                    selection.suite_id
                )),
                Some(suite) if suite.size != group.size => problems.push(format!(
                    "Suite {} holds {} but group {} has {} members.",
                    suite.number, suite.size, group.id, group.size
                )),
                Some(suite) if suite.group.is_some() => {
                    conflicts.push(format!("Suite {} has already been taken.", suite.number))
                }
                Some(_) => {}
            }
        }

        for group in &unit.pending {
            if !seen_groups.contains(&group.id) {
                problems.push(format!("Group {} needs a suite in this pick.", group.id));
            }
        }

        if !problems.is_empty() {
            return Err(DrawError::Validation(problems));
        }
        if !conflicts.is_empty() {
            return Err(DrawError::Conflict(conflicts.join(" ")));
        }
        Ok(selections.to_vec())
    }

    /// Unbinds a group's suite during selection; the group rejoins its queue.
    pub fn remove_suite(
        aggregate: &mut DrawAggregate,
        group_id: &GroupId,
    ) -> Result<SuiteId, DrawError> {
        let phase = aggregate.phase();
        if phase != DrawPhase::SuiteSelection {
            return Err(GuardViolation::WrongPhase {
                action: DrawAction::RemoveSuite,
                phase,
            }
            .into());
        }

        let registry = GroupRegistry::new(aggregate);
        if registry.group(group_id).is_none() {
            return Err(DrawError::invalid(format!(
                "Group {group_id} is not part of this draw."
            )));
        }
        let lottery_id = registry
            .assignment_for(group_id)
            .map(|assignment| assignment.id.clone());

        let suite = aggregate
            .suites
            .iter_mut()
            .find(|suite| suite.group.as_ref() == Some(group_id))
            .ok_or_else(|| DrawError::invalid(format!("Group {group_id} holds no suite.")))?;
        suite.group = None;
        let suite_id = suite.id.clone();

        if let Some(lottery_id) = lottery_id {
            LotteryAssignmentEngine::recompute_selected(aggregate, &lottery_id);
        }
        Ok(suite_id)
    }
}
