//! Read-only lookups over a [`DrawAggregate`]: who owns which number, which
//! suite houses which group, and how demand compares to supply per size.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::domain::{
    Clip, DrawAggregate, Group, GroupId, LotteryAssignment, LotteryOwner, Suite, SuiteSize,
};

/// Groups versus suites for one size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeDemand {
    pub size: SuiteSize,
    pub groups: usize,
    pub suites: usize,
    /// Groups minus suites; positive means oversubscribed.
    pub excess: i64,
}

impl SizeDemand {
    pub fn oversubscribed(&self) -> bool {
        self.excess > 0
    }
}

/// A group's position among the numbered groups of its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupRank {
    pub lottery_number: u32,
    pub group_size: SuiteSize,
    /// 1-based.
    pub rank: usize,
    pub total_in_size: usize,
}

pub struct GroupRegistry<'a> {
    aggregate: &'a DrawAggregate,
}

impl<'a> GroupRegistry<'a> {
    pub fn new(aggregate: &'a DrawAggregate) -> Self {
        Self { aggregate }
    }

    pub fn group(&self, id: &GroupId) -> Option<&'a Group> {
        self.aggregate.groups.iter().find(|group| &group.id == id)
    }

    pub fn suite_for(&self, id: &GroupId) -> Option<&'a Suite> {
        self.aggregate
            .suites
            .iter()
            .find(|suite| suite.group.as_ref() == Some(id))
    }

    pub fn is_housed(&self, id: &GroupId) -> bool {
        self.suite_for(id).is_some()
    }

    pub fn clip_of(&self, id: &GroupId) -> Option<&'a Clip> {
        self.aggregate.clips.iter().find(|clip| clip.contains(id))
    }

    /// Groups sharing an assignment's number, in clip order and limited to the draw.
    pub fn covered_groups(&self, assignment: &LotteryAssignment) -> Vec<&'a Group> {
        match &assignment.owner {
            LotteryOwner::Group(id) => self.group(id).into_iter().collect(),
            LotteryOwner::Clip(clip_id) => self
                .aggregate
                .clips
                .iter()
                .find(|clip| &clip.id == clip_id)
                .map(|clip| clip.groups.iter().filter_map(|id| self.group(id)).collect())
                .unwrap_or_default(),
        }
    }

    /// The assignment a group holds directly or through its clip.
    pub fn assignment_for(&self, id: &GroupId) -> Option<&'a LotteryAssignment> {
        let clip = self.clip_of(id);
        self.aggregate.lottery.iter().find(|assignment| match &assignment.owner {
            LotteryOwner::Group(owner) => owner == id,
            LotteryOwner::Clip(owner) => clip.is_some_and(|clip| &clip.id == owner),
        })
    }

    pub fn lottery_number(&self, id: &GroupId) -> Option<u32> {
        self.assignment_for(id).map(|assignment| assignment.number)
    }

    pub fn unnumbered_groups(&self) -> Vec<&'a Group> {
        let covered: BTreeSet<&GroupId> = self
            .aggregate
            .lottery
            .iter()
            .flat_map(|assignment| self.covered_groups(assignment))
            .map(|group| &group.id)
            .collect();
        self.aggregate
            .groups
            .iter()
            .filter(|group| !covered.contains(&group.id))
            .collect()
    }

    pub fn bed_count(&self) -> usize {
        self.aggregate
            .suites
            .iter()
            .map(|suite| usize::from(suite.size))
            .sum()
    }

    pub fn groups_by_size(&self) -> BTreeMap<SuiteSize, usize> {
        let mut counts = BTreeMap::new();
        for group in &self.aggregate.groups {
            *counts.entry(group.size).or_insert(0) += 1;
        }
        counts
    }

    pub fn suites_by_size(&self) -> BTreeMap<SuiteSize, usize> {
        let mut counts = BTreeMap::new();
        for suite in &self.aggregate.suites {
            *counts.entry(suite.size).or_insert(0) += 1;
        }
        counts
    }

    /// Unassigned suites per size; sizes with none left are omitted.
    pub fn available_by_size(&self) -> BTreeMap<SuiteSize, usize> {
        let mut counts = BTreeMap::new();
        for suite in self.aggregate.suites.iter().filter(|suite| suite.group.is_none()) {
            *counts.entry(suite.size).or_insert(0) += 1;
        }
        counts
    }

    pub fn demand(&self) -> Vec<SizeDemand> {
        let groups = self.groups_by_size();
        let suites = self.suites_by_size();
        let sizes: BTreeSet<SuiteSize> = groups.keys().chain(suites.keys()).copied().collect();

        sizes
            .into_iter()
            .map(|size| {
                let group_count = groups.get(&size).copied().unwrap_or(0);
                let suite_count = suites.get(&size).copied().unwrap_or(0);
                SizeDemand {
                    size,
                    groups: group_count,
                    suites: suite_count,
                    excess: group_count as i64 - suite_count as i64,
                }
            })
            .collect()
    }

    pub fn oversubscribed_sizes(&self) -> Vec<SizeDemand> {
        self.demand()
            .into_iter()
            .filter(SizeDemand::oversubscribed)
            .collect()
    }

    /// Numbered groups of one size, best number first.
    pub fn ranking(&self, size: SuiteSize) -> Vec<(u32, &'a Group)> {
        let mut ranked: Vec<(u32, &'a Group)> = self
            .aggregate
            .groups
            .iter()
            .filter(|group| group.size == size)
            .filter_map(|group| self.lottery_number(&group.id).map(|number| (number, group)))
            .collect();
        ranked.sort_by(|(a, left), (b, right)| a.cmp(b).then_with(|| left.id.cmp(&right.id)));
        ranked
    }

    /// `None` when the group is outside the draw or has no number yet.
    pub fn rank_of(&self, id: &GroupId) -> Option<GroupRank> {
        let group = self.group(id)?;
        let number = self.lottery_number(id)?;
        let ranking = self.ranking(group.size);
        let position = ranking
            .iter()
            .position(|(_, ranked)| &ranked.id == id)?;
        let total_in_size = self
            .aggregate
            .groups
            .iter()
            .filter(|other| other.size == group.size)
            .count();

        Some(GroupRank {
            lottery_number: number,
            group_size: group.size,
            rank: position + 1,
            total_in_size,
        })
    }
}
