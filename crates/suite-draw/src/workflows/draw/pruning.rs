use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::domain::{DrawAggregate, Group, GroupId, LotteryOwner, SuiteSize};
use super::error::DrawError;
use super::registry::GroupRegistry;

/// Sizes a prune request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneTarget {
    Size(SuiteSize),
    Oversubscribed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneOutcome {
    pub pruned: BTreeMap<SuiteSize, usize>,
    pub removed: Vec<GroupId>,
    pub failures: BTreeMap<SuiteSize, String>,
    pub message: String,
}

impl PruneOutcome {
    pub(crate) fn summarize(&mut self) {
        let total: usize = self.pruned.values().sum();
        self.message = if self.pruned.is_empty() && self.failures.is_empty() {
            "No oversubscribed sizes to prune.".to_string()
        } else {
            let sizes = self
                .pruned
                .iter()
                .map(|(size, count)| format!("{count} of size {size}"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut message = if total == 0 {
                "No groups were pruned.".to_string()
            } else {
                format!("Pruned {total} group(s): {sizes}.")
            };
            for (size, failure) in &self.failures {
                message.push_str(&format!(" Size {size} failed: {failure}"));
            }
            message
        };
    }
}

pub struct OversubscriptionPruner;

impl OversubscriptionPruner {
    /// Sizes to visit for a request; an explicit size is visited even when it
    /// turns out not to be oversubscribed.
    pub fn target_sizes(aggregate: &DrawAggregate, target: PruneTarget) -> Vec<SuiteSize> {
        match target {
            PruneTarget::Size(size) => vec![size],
            PruneTarget::Oversubscribed => GroupRegistry::new(aggregate)
                .oversubscribed_sizes()
                .into_iter()
                .map(|demand| demand.size)
                .collect(),
        }
    }

    pub fn excess(aggregate: &DrawAggregate, size: SuiteSize) -> usize {
        let groups = aggregate.groups.iter().filter(|g| g.size == size).count();
        let suites = aggregate.suites.iter().filter(|s| s.size == size).count();
        groups.saturating_sub(suites)
    }

    /// Groups of `size` in the order they would be removed: unnumbered first
    /// (latest arrival, then greatest id), then numbered by descending number.
    pub fn removal_order(aggregate: &DrawAggregate, size: SuiteSize) -> Vec<GroupId> {
        let registry = GroupRegistry::new(aggregate);
        let (mut numbered, mut unnumbered): (Vec<(u32, &Group)>, Vec<&Group>) = (
            Vec::new(),
            Vec::new(),
        );
        for group in aggregate.groups.iter().filter(|group| group.size == size) {
            match registry.lottery_number(&group.id) {
                Some(number) => numbered.push((number, group)),
                None => unnumbered.push(group),
            }
        }

        unnumbered.sort_by_key(|group| Reverse((group.formed_at, group.id.clone())));
        numbered.sort_by_key(|(number, _)| Reverse(*number));

        unnumbered
            .into_iter()
            .map(|group| group.id.clone())
            .chain(numbered.into_iter().map(|(_, group)| group.id.clone()))
            .collect()
    }

    /// Removes the excess groups of one size. Either every selected group is
    /// detached or an error is returned and the caller drops the working copy.
    pub fn prune_size(
        aggregate: &mut DrawAggregate,
        size: SuiteSize,
    ) -> Result<Vec<GroupId>, DrawError> {
        let excess = Self::excess(aggregate, size);
        if excess == 0 {
            return Ok(Vec::new());
        }

        let doomed: Vec<GroupId> = Self::removal_order(aggregate, size)
            .into_iter()
            .take(excess)
            .collect();
        for group_id in &doomed {
            detach_group(aggregate, group_id)?;
            aggregate
                .lottery
                .retain(|assignment| assignment.owner.single_group() != Some(group_id));
        }
        Ok(doomed)
    }
}

/// Takes a group out of the draw: its members return to the unassigned pool,
/// it leaves its clip and any suite it held is released. A clip left empty is
/// dropped with its number. A number the group held alone stays behind as an
/// orphan until pruning or `start_selection` reclaims it.
pub(crate) fn detach_group(
    aggregate: &mut DrawAggregate,
    group_id: &GroupId,
) -> Result<Group, DrawError> {
    let position = aggregate
        .groups
        .iter()
        .position(|group| &group.id == group_id)
        .ok_or_else(|| DrawError::invalid(format!("Group {group_id} is not part of this draw.")))?;
    let mut group = aggregate.groups.remove(position);
    group.draw = None;

    let mut emptied = Vec::new();
    for clip in &mut aggregate.clips {
        clip.groups.retain(|member| member != group_id);
        if clip.groups.is_empty() {
            emptied.push(clip.id.clone());
        }
    }
    aggregate.clips.retain(|clip| !clip.groups.is_empty());

    aggregate.lottery.retain(|assignment| match &assignment.owner {
        LotteryOwner::Group(_) => true,
        LotteryOwner::Clip(clip) => !emptied.contains(clip),
    });

    for suite in &mut aggregate.suites {
        if suite.group.as_ref() == Some(group_id) {
            suite.group = None;
        }
    }

    Ok(group)
}
