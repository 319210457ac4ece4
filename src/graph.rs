//! Referral graph construction.
//!
//! The graph source may answer with a bare list, an object wrapping a `list`,
//! or a single nested tree, and nodes may link through nested `children`
//! (or `referrals`) or through a flat `parent_id`. Everything is normalized
//! here into one arena-backed forest hanging off the querying root. Levels
//! come from traversal depth; a declared `level` is only used for nodes whose
//! ancestry cannot be computed.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::EngineError;
use crate::types::{Affiliate, AffiliateId, AffiliateStatus};

/// One node as delivered by the graph source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub id: AffiliateId,
    #[serde(default, alias = "referral_code", alias = "referralCode")]
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default = "default_status", deserialize_with = "lenient_status")]
    pub status: AffiliateStatus,
    #[serde(default, alias = "registeredAt")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "parentId")]
    pub parent_id: Option<AffiliateId>,
    #[serde(default, alias = "referrals")]
    pub children: Vec<RawNode>,
}

fn default_status() -> AffiliateStatus {
    AffiliateStatus::Active
}

fn lenient_status<'de, D>(deserializer: D) -> Result<AffiliateStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

impl RawNode {
    pub fn new(id: AffiliateId, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            name: name.into(),
            level: None,
            status: AffiliateStatus::Active,
            registered_at: None,
            parent_id: None,
            children: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: AffiliateId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_children(mut self, children: Vec<RawNode>) -> Self {
        self.children = children;
        self
    }
}

/// Every shape the graph source is known to answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkPayload {
    Wrapped { list: Vec<RawNode> },
    List(Vec<RawNode>),
    Tree(RawNode),
}

impl NetworkPayload {
    fn into_nodes(self) -> Vec<RawNode> {
        match self {
            NetworkPayload::Wrapped { list } | NetworkPayload::List(list) => list,
            NetworkPayload::Tree(node) => vec![node],
        }
    }
}

/// A problem found while normalizing a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// The affiliate showed up again below itself or below another branch.
    RepeatedAffiliate { affiliate_id: AffiliateId },
    /// These affiliates only reference each other through parent links.
    Cycle { affiliate_ids: Vec<AffiliateId> },
    /// Parent is missing from the payload and no level was declared.
    Orphan {
        affiliate_id: AffiliateId,
        parent_id: AffiliateId,
    },
    /// The declared level leaves no room for this affiliate's recruits;
    /// they were dropped.
    LevelOverflow { affiliate_id: AffiliateId, level: u32 },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::RepeatedAffiliate { affiliate_id } => {
                write!(f, "affiliate {} appears more than once in the network", affiliate_id)
            }
            IntegrityIssue::Cycle { affiliate_ids } => {
                write!(f, "parent references form a cycle through {:?}", affiliate_ids)
            }
            IntegrityIssue::Orphan {
                affiliate_id,
                parent_id,
            } => write!(
                f,
                "affiliate {} references unknown parent {}",
                affiliate_id, parent_id
            ),
            IntegrityIssue::LevelOverflow {
                affiliate_id,
                level,
            } => write!(
                f,
                "affiliate {} declares level {} with recruits below it",
                affiliate_id, level
            ),
        }
    }
}

/// An affiliate placed in the downstream tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralNode {
    pub affiliate: Affiliate,
    /// Distance from the root.
    pub level: u32,
    /// The level the source claimed, kept for display only.
    pub declared_level: Option<u32>,
    #[serde(skip)]
    pub parent: Option<usize>,
    #[serde(skip)]
    pub children: Vec<usize>,
}

/// Downstream network of one root affiliate. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferralGraph {
    root: AffiliateId,
    nodes: Vec<ReferralNode>,
    tops: Vec<usize>,
    issues: Vec<IntegrityIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentRef {
    None,
    Occurrence(usize),
    Id(AffiliateId),
}

struct Occurrence {
    node: RawNode,
    parent: ParentRef,
}

struct Frame {
    occurrence: usize,
    level: u32,
    parent: Option<usize>,
    parent_id: Option<AffiliateId>,
}

impl ReferralGraph {
    /// Normalizes `payload` into the downstream tree of `root`.
    ///
    /// Never fails: problems are recorded and reported by [`Self::issues`].
    pub fn from_payload(root: AffiliateId, payload: NetworkPayload) -> Self {
        let occurrences = flatten(payload.into_nodes());

        let known: HashSet<AffiliateId> = occurrences.iter().map(|o| o.node.id).collect();
        let mut by_occurrence: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut by_parent_id: HashMap<AffiliateId, Vec<usize>> = HashMap::new();
        for (idx, occ) in occurrences.iter().enumerate() {
            match occ.parent {
                ParentRef::Occurrence(p) => by_occurrence.entry(p).or_default().push(idx),
                ParentRef::Id(p) => by_parent_id.entry(p).or_default().push(idx),
                ParentRef::None => {}
            }
        }

        let mut graph = ReferralGraph {
            root,
            ..Default::default()
        };
        let mut issues = Vec::new();
        let mut starts: Vec<Frame> = Vec::new();

        // Children of the root, whether linked by id or nested under a root entry.
        let mut root_children: Vec<usize> = by_parent_id.get(&root).cloned().unwrap_or_default();
        for (idx, occ) in occurrences.iter().enumerate() {
            if occ.node.id == root && occ.parent == ParentRef::None {
                root_children.extend(by_occurrence.get(&idx).into_iter().flatten().copied());
            }
        }
        root_children.sort_unstable();
        for idx in root_children {
            starts.push(Frame {
                occurrence: idx,
                level: 1,
                parent: None,
                parent_id: Some(root),
            });
        }

        for (idx, occ) in occurrences.iter().enumerate() {
            if occ.node.id == root {
                continue;
            }
            match occ.parent {
                ParentRef::None => {
                    let level = occ.node.level.filter(|l| *l > 0).unwrap_or(1);
                    starts.push(Frame {
                        occurrence: idx,
                        level,
                        parent: None,
                        parent_id: (level == 1).then_some(root),
                    })
                }
                ParentRef::Id(p) if p != root && !known.contains(&p) => match occ.node.level {
                    Some(level) if level > 0 => starts.push(Frame {
                        occurrence: idx,
                        level,
                        parent: None,
                        parent_id: Some(p),
                    }),
                    _ => issues.push(IntegrityIssue::Orphan {
                        affiliate_id: occ.node.id,
                        parent_id: p,
                    }),
                },
                _ => {}
            }
        }

        let mut visited: HashSet<AffiliateId> = HashSet::from([root]);
        let mut reached = vec![false; occurrences.len()];
        for start in starts {
            let mut stack = vec![start];
            while let Some(frame) = stack.pop() {
                let occ = &occurrences[frame.occurrence];
                reached[frame.occurrence] = true;
                if !visited.insert(occ.node.id) {
                    issues.push(IntegrityIssue::RepeatedAffiliate {
                        affiliate_id: occ.node.id,
                    });
                    // The nested subtree goes with it.
                    let mut dropped: Vec<usize> = vec![frame.occurrence];
                    while let Some(d) = dropped.pop() {
                        reached[d] = true;
                        dropped.extend(by_occurrence.get(&d).into_iter().flatten().copied());
                    }
                    continue;
                }

                let idx = graph.nodes.len();
                graph.nodes.push(ReferralNode {
                    affiliate: Affiliate {
                        id: occ.node.id,
                        referral_code: occ.node.code.clone(),
                        name: occ.node.name.clone(),
                        status: occ.node.status,
                        parent_id: frame.parent_id,
                        created_at: occ.node.registered_at,
                    },
                    level: frame.level,
                    declared_level: occ.node.level,
                    parent: frame.parent,
                    children: Vec::new(),
                });
                match frame.parent {
                    Some(p) => graph.nodes[p].children.push(idx),
                    None => graph.tops.push(idx),
                }

                let mut children: Vec<usize> = by_occurrence
                    .get(&frame.occurrence)
                    .into_iter()
                    .flatten()
                    .copied()
                    .collect();
                children.extend(by_parent_id.get(&occ.node.id).into_iter().flatten().copied());
                children.sort_unstable();
                let Some(child_level) = frame.level.checked_add(1) else {
                    if !children.is_empty() {
                        issues.push(IntegrityIssue::LevelOverflow {
                            affiliate_id: occ.node.id,
                            level: frame.level,
                        });
                        mark_reached(children, &occurrences, &by_occurrence, &by_parent_id, &mut reached);
                    }
                    continue;
                };
                for child in children.into_iter().rev() {
                    stack.push(Frame {
                        occurrence: child,
                        level: child_level,
                        parent: Some(idx),
                        parent_id: Some(occ.node.id),
                    });
                }
            }
        }

        let mut looped: Vec<AffiliateId> = occurrences
            .iter()
            .enumerate()
            .filter(|(idx, occ)| {
                !reached[*idx]
                    && occ.node.id != root
                    && !issues.iter().any(|i| {
                        matches!(i, IntegrityIssue::Orphan { affiliate_id, .. } if *affiliate_id == occ.node.id)
                    })
            })
            .map(|(_, occ)| occ.node.id)
            .collect();
        if !looped.is_empty() {
            looped.sort_unstable();
            looped.dedup();
            issues.push(IntegrityIssue::Cycle {
                affiliate_ids: looped,
            });
        }

        graph.issues = issues;
        graph
    }

    pub fn root(&self) -> AffiliateId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> Option<&ReferralNode> {
        self.nodes.get(idx)
    }

    pub fn nodes(&self) -> &[ReferralNode] {
        &self.nodes
    }

    /// Nodes without a parent inside the graph, in payload order.
    pub fn tops(&self) -> &[usize] {
        &self.tops
    }

    pub fn issues(&self) -> &[IntegrityIssue] {
        &self.issues
    }

    pub fn ensure_consistent(&self) -> Result<(), EngineError> {
        if self.issues.is_empty() {
            return Ok(());
        }
        let detail = self
            .issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(EngineError::DataIntegrity(detail))
    }

    /// Content hash used to memoize aggregation.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.root.hash(&mut hasher);
        for node in &self.nodes {
            node.affiliate.id.hash(&mut hasher);
            node.level.hash(&mut hasher);
            node.parent.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Marks `from` and everything hanging below it as handled.
fn mark_reached(
    from: Vec<usize>,
    occurrences: &[Occurrence],
    by_occurrence: &HashMap<usize, Vec<usize>>,
    by_parent_id: &HashMap<AffiliateId, Vec<usize>>,
    reached: &mut [bool],
) {
    let mut pending = from;
    while let Some(idx) = pending.pop() {
        if reached[idx] {
            continue;
        }
        reached[idx] = true;
        pending.extend(by_occurrence.get(&idx).into_iter().flatten().copied());
        pending.extend(
            by_parent_id
                .get(&occurrences[idx].node.id)
                .into_iter()
                .flatten()
                .copied(),
        );
    }
}

fn flatten(nodes: Vec<RawNode>) -> Vec<Occurrence> {
    let mut out = Vec::new();
    let mut stack: Vec<(RawNode, ParentRef)> = nodes
        .into_iter()
        .rev()
        .map(|n| {
            let parent = n.parent_id.map_or(ParentRef::None, ParentRef::Id);
            (n, parent)
        })
        .collect();
    while let Some((mut node, parent)) = stack.pop() {
        let children = std::mem::take(&mut node.children);
        let idx = out.len();
        out.push(Occurrence { node, parent });
        for child in children.into_iter().rev() {
            stack.push((child, ParentRef::Occurrence(idx)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(graph: &ReferralGraph) -> Vec<(AffiliateId, u32)> {
        let mut out: Vec<_> = graph
            .nodes()
            .iter()
            .map(|n| (n.affiliate.id, n.level))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn normalizes_list_and_wrapped_shapes_alike() {
        let list = r#"[{"id":2,"code":"B","name":"b","parentId":1},
                       {"id":3,"code":"C","name":"c","parentId":2}]"#;
        let wrapped = r#"{"list":[{"id":2,"code":"B","name":"b","parentId":1},
                                 {"id":3,"code":"C","name":"c","parentId":2}]}"#;
        let a: NetworkPayload = serde_json::from_str(list).unwrap();
        let b: NetworkPayload = serde_json::from_str(wrapped).unwrap();
        let ga = ReferralGraph::from_payload(1, a);
        let gb = ReferralGraph::from_payload(1, b);
        assert_eq!(levels(&ga), vec![(2, 1), (3, 2)]);
        assert_eq!(ga.fingerprint(), gb.fingerprint());
        assert!(ga.issues().is_empty());
    }

    #[test]
    fn nested_tree_with_referrals_key_uses_depth_not_declared_level() {
        let json = r#"{"id":1,"code":"ROOT","name":"root","status":"active","referrals":[
            {"id":2,"code":"B","name":"b","level":5,"referrals":[
                {"id":4,"code":"D","name":"d","level":1}]},
            {"id":3,"code":"C","name":"c"}]}"#;
        let payload: NetworkPayload = serde_json::from_str(json).unwrap();
        let graph = ReferralGraph::from_payload(1, payload);
        assert_eq!(levels(&graph), vec![(2, 1), (3, 1), (4, 2)]);
        let d = graph.nodes().iter().find(|n| n.affiliate.id == 4).unwrap();
        assert_eq!(d.declared_level, Some(1));
        assert_eq!(d.affiliate.parent_id, Some(2));
    }

    #[test]
    fn declared_level_is_fallback_without_ancestry() {
        let payload = NetworkPayload::List(vec![
            RawNode::new(10, "J", "j").with_level(3),
            RawNode::new(11, "K", "k").with_parent(10),
            RawNode::new(12, "L", "l").with_parent(99).with_level(4),
        ]);
        let graph = ReferralGraph::from_payload(1, payload);
        assert_eq!(levels(&graph), vec![(10, 3), (11, 4), (12, 4)]);
        assert!(graph.issues().is_empty());
    }

    #[test]
    fn maximal_declared_level_drops_recruits_instead_of_overflowing() {
        let payload = NetworkPayload::List(vec![
            RawNode::new(10, "J", "j").with_level(u32::MAX),
            RawNode::new(11, "K", "k").with_parent(10),
            RawNode::new(12, "L", "l").with_parent(11),
        ]);
        let graph = ReferralGraph::from_payload(1, payload);
        assert_eq!(levels(&graph), vec![(10, u32::MAX)]);
        assert_eq!(
            graph.issues(),
            &[IntegrityIssue::LevelOverflow {
                affiliate_id: 10,
                level: u32::MAX
            }]
        );
    }

    #[test]
    fn orphan_without_level_is_reported() {
        let payload = NetworkPayload::List(vec![RawNode::new(5, "E", "e").with_parent(42)]);
        let graph = ReferralGraph::from_payload(1, payload);
        assert!(graph.is_empty());
        assert_eq!(
            graph.issues(),
            &[IntegrityIssue::Orphan {
                affiliate_id: 5,
                parent_id: 42
            }]
        );
        assert!(matches!(
            graph.ensure_consistent(),
            Err(EngineError::DataIntegrity(_))
        ));
    }

    #[test]
    fn parent_reference_cycle_terminates_and_is_reported() {
        let payload = NetworkPayload::List(vec![
            RawNode::new(2, "A", "a").with_parent(4),
            RawNode::new(3, "B", "b").with_parent(2),
            RawNode::new(4, "C", "c").with_parent(3),
        ]);
        let graph = ReferralGraph::from_payload(1, payload);
        assert!(graph.is_empty());
        assert_eq!(
            graph.issues(),
            &[IntegrityIssue::Cycle {
                affiliate_ids: vec![2, 3, 4]
            }]
        );
    }

    #[test]
    fn repeated_affiliate_aborts_only_that_subtree() {
        let tree = RawNode::new(2, "A", "a").with_children(vec![
            RawNode::new(3, "B", "b").with_children(vec![RawNode::new(4, "C", "c")
                .with_children(vec![RawNode::new(2, "A", "a")
                    .with_children(vec![RawNode::new(9, "Z", "z")])])]),
            RawNode::new(5, "E", "e"),
        ]);
        let graph = ReferralGraph::from_payload(1, NetworkPayload::Tree(tree));
        assert_eq!(levels(&graph), vec![(2, 1), (3, 2), (4, 3), (5, 2)]);
        assert_eq!(
            graph.issues(),
            &[IntegrityIssue::RepeatedAffiliate { affiliate_id: 2 }]
        );
    }

    #[test]
    fn root_listed_as_its_own_descendant_is_reported() {
        let payload = NetworkPayload::List(vec![
            RawNode::new(2, "A", "a").with_parent(1),
            RawNode::new(1, "R", "r").with_parent(2),
        ]);
        let graph = ReferralGraph::from_payload(1, payload);
        assert_eq!(levels(&graph), vec![(2, 1)]);
        assert_eq!(
            graph.issues(),
            &[IntegrityIssue::RepeatedAffiliate { affiliate_id: 1 }]
        );
    }
}
