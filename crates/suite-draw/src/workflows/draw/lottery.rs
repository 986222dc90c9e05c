use std::collections::BTreeSet;

use super::domain::{
    DrawAction, DrawAggregate, DrawPhase, GroupId, LotteryAssignment, LotteryId, LotteryOwner,
};
use super::error::{DrawError, GuardViolation};
use super::registry::GroupRegistry;

/// Issues, validates and retracts lottery numbers on a working aggregate.
pub struct LotteryAssignmentEngine;

impl LotteryAssignmentEngine {
    /// Every rule violation is collected before anything is written.
    pub fn assign(
        aggregate: &mut DrawAggregate,
        number: i64,
        owner: LotteryOwner,
    ) -> Result<LotteryAssignment, DrawError> {
        let phase = aggregate.phase();
        if phase != DrawPhase::Lottery {
            return Err(GuardViolation::WrongPhase {
                action: DrawAction::AssignLotteryNumber,
                phase,
            }
            .into());
        }

        let mut problems = Vec::new();
        let number = if number <= 0 {
            problems.push(format!("Lottery number {number} must be a positive integer."));
            None
        } else if let Ok(value) = u32::try_from(number) {
            Some(value)
        } else {
            problems.push(format!("Lottery number {number} is out of range."));
            None
        };

        if let Some(value) = number {
            if aggregate.lottery.iter().any(|existing| existing.number == value) {
                problems.push(format!("Lottery number {value} is already taken in this draw."));
            }
        }

        let registry = GroupRegistry::new(aggregate);
        let covered: Vec<GroupId> = match &owner {
            LotteryOwner::Group(group_id) => {
                if registry.group(group_id).is_none() {
                    problems.push(format!("Group {group_id} is not part of this draw."));
                } else if let Some(clip) = registry.clip_of(group_id) {
                    problems.push(format!(
                        "Group {group_id} belongs to clip {}; number the clip instead.",
                        clip.id
                    ));
                }
                vec![group_id.clone()]
            }
            LotteryOwner::Clip(clip_id) => {
                match aggregate.clips.iter().find(|clip| &clip.id == clip_id) {
                    Some(clip) if clip.groups.is_empty() => {
                        problems.push(format!("Clip {clip_id} has no groups."));
                        Vec::new()
                    }
                    Some(clip) => clip.groups.clone(),
                    None => {
                        problems.push(format!("Clip {clip_id} is not part of this draw."));
                        Vec::new()
                    }
                }
            }
        };

        for group_id in &covered {
            if let Some(existing) = registry.assignment_for(group_id) {
                problems.push(format!(
                    "Group {group_id} already holds lottery number {}.",
                    existing.number
                ));
            }
        }

        match number {
            Some(value) if problems.is_empty() => {
                let assignment = LotteryAssignment::new(aggregate.id().clone(), value, owner);
                aggregate.lottery.push(assignment.clone());
                Ok(assignment)
            }
            _ => Err(DrawError::Validation(problems)),
        }
    }

    pub fn retract(
        aggregate: &mut DrawAggregate,
        lottery_id: &LotteryId,
    ) -> Result<LotteryAssignment, DrawError> {
        let phase = aggregate.phase();
        if !phase.before_selection() {
            return Err(GuardViolation::WrongPhase {
                action: DrawAction::RetractLotteryNumber,
                phase,
            }
            .into());
        }

        let position = aggregate
            .lottery
            .iter()
            .position(|assignment| &assignment.id == lottery_id)
            .ok_or_else(|| {
                DrawError::invalid(format!("Lottery assignment {lottery_id} does not exist."))
            })?;
        Ok(aggregate.lottery.remove(position))
    }

    /// Sets `selected` to whether every covered group has a suite. Returns
    /// `true` only when the stored value changed.
    pub fn recompute_selected(aggregate: &mut DrawAggregate, lottery_id: &LotteryId) -> bool {
        let Some(assignment) = aggregate
            .lottery
            .iter()
            .find(|assignment| &assignment.id == lottery_id)
        else {
            return false;
        };

        let registry = GroupRegistry::new(aggregate);
        let covered = registry.covered_groups(assignment);
        let selected =
            !covered.is_empty() && covered.iter().all(|group| registry.is_housed(&group.id));
        if selected == assignment.selected() {
            return false;
        }

        if let Some(assignment) = aggregate
            .lottery
            .iter_mut()
            .find(|assignment| &assignment.id == lottery_id)
        {
            assignment.set_selected(selected);
        }
        true
    }

    /// Assignments whose covered groups have all left the draw.
    pub fn orphaned(aggregate: &DrawAggregate) -> Vec<LotteryId> {
        let registry = GroupRegistry::new(aggregate);
        aggregate
            .lottery
            .iter()
            .filter(|assignment| registry.covered_groups(assignment).is_empty())
            .map(|assignment| assignment.id.clone())
            .collect()
    }

    pub fn discard(aggregate: &mut DrawAggregate, ids: &[LotteryId]) -> usize {
        let doomed: BTreeSet<&LotteryId> = ids.iter().collect();
        let before = aggregate.lottery.len();
        aggregate
            .lottery
            .retain(|assignment| !doomed.contains(&assignment.id));
        before - aggregate.lottery.len()
    }
}
