use std::collections::BTreeMap;

use serde::Serialize;

use crate::graph::{ReferralGraph, ReferralNode};
use crate::plan::MAX_COMMISSION_LEVEL;
use crate::types::{CommissionRecord, CommissionStatus};

/// Member counts per level of a downstream network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LevelStats {
    pub members_per_level: BTreeMap<u32, u64>,
    pub total_members: u64,
}

/// A display row: levels 1 to 10 individually, everything deeper rolled up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelRow {
    pub label: String,
    pub members: u64,
    pub commission_total: i64,
}

impl LevelStats {
    pub fn members_at(&self, level: u32) -> u64 {
        self.members_per_level.get(&level).copied().unwrap_or(0)
    }

    /// Members deeper than the last commissionable level.
    pub fn members_beyond_commission_range(&self) -> u64 {
        self.members_per_level
            .range(MAX_COMMISSION_LEVEL + 1..)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn display_rows(&self, commission_totals: &BTreeMap<u32, i64>) -> Vec<LevelRow> {
        let mut rows: Vec<LevelRow> = (1..=MAX_COMMISSION_LEVEL)
            .map(|level| LevelRow {
                label: level.to_string(),
                members: self.members_at(level),
                commission_total: commission_totals.get(&level).copied().unwrap_or(0),
            })
            .collect();
        rows.push(LevelRow {
            label: format!("{}+", MAX_COMMISSION_LEVEL + 1),
            members: self.members_beyond_commission_range(),
            commission_total: commission_totals
                .range(MAX_COMMISSION_LEVEL + 1..)
                .map(|(_, amount)| amount)
                .sum(),
        });
        rows
    }
}

/// Counts every node at its traversal depth.
///
/// Walks with an explicit stack; levels declared by the source are ignored.
pub fn aggregate(graph: &ReferralGraph) -> LevelStats {
    let mut stats = LevelStats::default();
    let mut stack: Vec<(usize, u32)> = graph
        .tops()
        .iter()
        .filter_map(|&idx| graph.node(idx).map(|n| (idx, n.level)))
        .collect();

    while let Some((idx, depth)) = stack.pop() {
        let Some(node) = graph.node(idx) else {
            continue;
        };
        *stats.members_per_level.entry(depth).or_insert(0) += 1;
        stats.total_members += 1;
        stack.extend(node.children.iter().map(|&child| (child, depth.saturating_add(1))));
    }
    stats
}

/// Members placed at `level`, in traversal order.
pub fn level_data(graph: &ReferralGraph, level: u32) -> Vec<&ReferralNode> {
    graph.nodes().iter().filter(|n| n.level == level).collect()
}

/// Sums commission amounts per level, skipping rejected records.
pub fn commission_totals(records: &[CommissionRecord]) -> BTreeMap<u32, i64> {
    let mut totals = BTreeMap::new();
    for record in records
        .iter()
        .filter(|r| r.status != CommissionStatus::Rejected)
    {
        *totals.entry(record.level).or_insert(0) += record.amount;
    }
    totals
}

/// Remembers the stats of the last graph it saw.
#[derive(Debug, Default)]
pub struct MemoizedAggregator {
    last: Option<(u64, LevelStats)>,
}

impl MemoizedAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(&mut self, graph: &ReferralGraph) -> LevelStats {
        let fingerprint = graph.fingerprint();
        if let Some((seen, stats)) = &self.last {
            if *seen == fingerprint {
                return stats.clone();
            }
        }
        let stats = aggregate(graph);
        self.last = Some((fingerprint, stats.clone()));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NetworkPayload, RawNode};
    use chrono::Utc;
    use uuid::Uuid;

    /// A chain of `depth` levels under root 1, with two members per level.
    fn chain(depth: u32) -> ReferralGraph {
        let mut nodes = Vec::new();
        let mut parent = 1;
        for level in 1..=depth {
            let spine = (level as i64) * 100;
            nodes.push(RawNode::new(spine, format!("S{level}"), "spine").with_parent(parent));
            nodes.push(RawNode::new(spine + 1, format!("L{level}"), "leaf").with_parent(parent));
            parent = spine;
        }
        ReferralGraph::from_payload(1, NetworkPayload::List(nodes))
    }

    fn assert_level_sum(graph: &ReferralGraph) {
        let stats = aggregate(graph);
        let sum: u64 = stats.members_per_level.values().sum();
        assert_eq!(sum, stats.total_members);
        assert_eq!(stats.total_members, graph.len() as u64);
    }

    #[test]
    fn level_sum_matches_visited_nodes_at_every_depth() {
        for depth in [0, 1, 10, 15] {
            let graph = chain(depth);
            assert_level_sum(&graph);
            let stats = aggregate(&graph);
            assert_eq!(stats.total_members, 2 * depth as u64);
            for level in 1..=depth {
                assert_eq!(stats.members_at(level), 2);
            }
        }
    }

    #[test]
    fn deep_levels_roll_up_into_last_row() {
        let stats = aggregate(&chain(15));
        assert_eq!(stats.members_beyond_commission_range(), 10);
        let rows = stats.display_rows(&BTreeMap::new());
        assert_eq!(rows.len(), 11);
        assert_eq!(rows[10].label, "11+");
        assert_eq!(rows[10].members, 10);
        assert_eq!(rows.iter().map(|r| r.members).sum::<u64>(), 30);
    }

    #[test]
    fn declared_levels_do_not_change_counts() {
        let payload = NetworkPayload::List(vec![
            RawNode::new(2, "A", "a").with_parent(1).with_level(7),
            RawNode::new(3, "B", "b").with_parent(2).with_level(1),
        ]);
        let graph = ReferralGraph::from_payload(1, payload);
        let stats = aggregate(&graph);
        assert_eq!(stats.members_at(1), 1);
        assert_eq!(stats.members_at(2), 1);
        assert_eq!(stats.members_at(7), 0);
    }

    #[test]
    fn cyclic_payload_aggregates_in_bounded_time() {
        let payload = NetworkPayload::List(vec![
            RawNode::new(2, "A", "a").with_parent(1),
            RawNode::new(3, "B", "b").with_parent(2),
            RawNode::new(4, "C", "c").with_parent(3),
            RawNode::new(2, "A", "a").with_parent(4),
        ]);
        let graph = ReferralGraph::from_payload(1, payload);
        let stats = aggregate(&graph);
        assert_eq!(stats.total_members, 3);
        assert!(graph.ensure_consistent().is_err());
    }

    #[test]
    fn level_data_lists_members_of_one_level() {
        let graph = chain(3);
        let ids: Vec<_> = level_data(&graph, 2).iter().map(|n| n.affiliate.id).collect();
        assert_eq!(ids, vec![200, 201]);
        assert!(level_data(&graph, 4).is_empty());
    }

    #[test]
    fn commission_totals_skip_rejected() {
        let record = |level, amount, status| CommissionRecord {
            id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            source_affiliate_id: 9,
            beneficiary_affiliate_id: 1,
            level,
            amount,
            status,
            created_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
            paid_at: None,
            note: None,
            rejection_reason: None,
        };
        let totals = commission_totals(&[
            record(1, 1_000, CommissionStatus::Pending),
            record(1, 500, CommissionStatus::Paid),
            record(2, 700, CommissionStatus::Rejected),
            record(2, 300, CommissionStatus::Approved),
        ]);
        assert_eq!(totals.get(&1), Some(&1_500));
        assert_eq!(totals.get(&2), Some(&300));
    }

    #[test]
    fn memoized_aggregator_reuses_result_for_same_graph() {
        let mut memo = MemoizedAggregator::new();
        let graph = chain(4);
        let first = memo.aggregate(&graph);
        let second = memo.aggregate(&graph.clone());
        assert_eq!(first, second);
        let other = memo.aggregate(&chain(2));
        assert_eq!(other.total_members, 4);
    }
}
