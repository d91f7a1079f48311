//! Tree service - read-only queries over the referral hierarchy
//!
//! Upline, downline and per-level statistics are all answered from the
//! closure index; nothing here walks parent pointers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::db::models::{referral_potential, IdentitySummary, Lead, Node, RelatedNode};
use crate::db::{closure, leads, nodes, ReferralDb};
use crate::error::ReferralError;

use super::collaborators::IdentityDirectory;

/// Score contributed by each downline member
const REFERRAL_WEIGHT: f64 = 20.0;
/// Score contributed by each lead in the subtree
const LEAD_WEIGHT: f64 = 25.0;
const CONVERSION_CAP: f64 = 100.0;

const CLICK_BONUS_THRESHOLD: i64 = 10;
const CLICK_BONUS: f64 = 50.0;
const REFERRAL_BONUS_THRESHOLD: i64 = 5;
const REFERRAL_BONUS: f64 = 100.0;
const LEAD_BONUS_THRESHOLD: i64 = 10;
const LEAD_BONUS: f64 = 75.0;

/// A direct referral with its owner's display data
#[derive(Debug, Clone, Serialize)]
pub struct ReferralEntry {
    pub node: Node,
    pub depth: i32,
    pub owner: Option<IdentitySummary>,
}

/// Aggregates over a node and everything below it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtreeStatistics {
    pub node_id: String,
    /// Number of strict descendants
    pub total_referrals: i64,
    /// Leads credited to the node and its descendants
    pub total_leads: i64,
    pub total_clicks: i64,
    /// Leads per hundred clicks, two decimals; 0 without clicks
    pub conversion_rate: f64,
    /// Descendant count per depth, only depths that occur
    pub depth_distribution: BTreeMap<i32, i64>,
    pub max_depth: i32,
}

/// One direct child on a level-one page
#[derive(Debug, Clone, Serialize)]
pub struct LevelOneEntry {
    pub node: Node,
    pub owner: Option<IdentitySummary>,
    pub direct_referrals: i64,
    pub total_downline: i64,
    /// Latest lead submitted through this child's node
    pub lead: Option<Lead>,
    pub lead_status: Option<String>,
    pub referral_potential: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelOnePage {
    pub items: Vec<LevelOneEntry>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub node: Node,
    pub score: f64,
    pub statistics: SubtreeStatistics,
}

/// Round to two decimals
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Statistics for `root` given its strict descendants
pub fn compute_statistics(root: &Node, descendants: &[RelatedNode]) -> SubtreeStatistics {
    let mut total_leads = root.lead_count;
    let mut total_clicks = root.click_count;
    let mut depth_distribution = BTreeMap::new();

    for related in descendants {
        total_leads += related.node.lead_count;
        total_clicks += related.node.click_count;
        *depth_distribution.entry(related.depth).or_insert(0) += 1;
    }

    let conversion_rate = if total_clicks > 0 {
        round2(total_leads as f64 * 100.0 / total_clicks as f64)
    } else {
        0.0
    };

    SubtreeStatistics {
        node_id: root.id.clone(),
        total_referrals: descendants.len() as i64,
        total_leads,
        total_clicks,
        conversion_rate,
        max_depth: depth_distribution.keys().next_back().copied().unwrap_or(0),
        depth_distribution,
    }
}

/// Performance score derived from subtree statistics
///
/// `referrals*20 + leads*25 + min(conversion*2, 100)` plus fixed bonuses for
/// crossing the click, referral and lead thresholds.
pub fn score_from_statistics(stats: &SubtreeStatistics) -> f64 {
    let mut score = stats.total_referrals as f64 * REFERRAL_WEIGHT
        + stats.total_leads as f64 * LEAD_WEIGHT
        + (stats.conversion_rate * 2.0).min(CONVERSION_CAP);

    if stats.total_clicks >= CLICK_BONUS_THRESHOLD {
        score += CLICK_BONUS;
    }
    if stats.total_referrals >= REFERRAL_BONUS_THRESHOLD {
        score += REFERRAL_BONUS;
    }
    if stats.total_leads >= LEAD_BONUS_THRESHOLD {
        score += LEAD_BONUS;
    }
    score
}

/// Read-only hierarchy queries
pub struct TreeService {
    db: Arc<ReferralDb>,
    identities: Arc<dyn IdentityDirectory>,
    config: Arc<Config>,
}

impl TreeService {
    /// Create a new tree service
    pub fn new(db: Arc<ReferralDb>, identities: Arc<dyn IdentityDirectory>, config: Arc<Config>) -> Self {
        Self { db, identities, config }
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// Direct referrals of a node with owner display data
    pub fn direct_referrals(&self, node_id: &str) -> Result<Vec<ReferralEntry>, ReferralError> {
        self.db.with_conn(|conn| {
            let children = closure::direct_children_of(conn, node_id)?;
            let owner_ids: Vec<String> = children
                .iter()
                .filter_map(|n| n.owner_identity_id.clone())
                .collect();
            let mut owners = self.identities.summaries(conn, &owner_ids)?;

            Ok(children
                .into_iter()
                .map(|node| {
                    let owner = node.owner_identity_id.as_ref().and_then(|id| owners.remove(id));
                    ReferralEntry { node, depth: 1, owner }
                })
                .collect())
        })
    }

    /// Every ancestor of a node, nearest first
    pub fn full_upline(&self, node_id: &str) -> Result<Vec<RelatedNode>, ReferralError> {
        self.db.with_conn(|conn| closure::ancestors_of(conn, node_id))
    }

    /// Every descendant of a node, shallowest first
    pub fn full_downline(&self, node_id: &str) -> Result<Vec<RelatedNode>, ReferralError> {
        self.db.with_conn(|conn| closure::descendants_of(conn, node_id))
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Aggregates over a node and its whole downline
    pub fn subtree_statistics(&self, node_id: &str) -> Result<SubtreeStatistics, ReferralError> {
        self.db.with_conn(|conn| {
            let root = nodes::require_node(conn, node_id)?;
            let descendants = closure::descendants_of(conn, node_id)?;
            Ok(compute_statistics(&root, &descendants))
        })
    }

    /// Performance score of a node
    pub fn performance_score(&self, node_id: &str) -> Result<f64, ReferralError> {
        Ok(score_from_statistics(&self.subtree_statistics(node_id)?))
    }

    /// One page of a node's direct children with per-child detail
    ///
    /// `page_no` is 1-based; values below 1 are treated as 1. `page_size` is
    /// clamped to `1..=max_page_size`.
    pub fn level_one_detail(&self, node_id: &str, page_no: i64, page_size: i64) -> Result<LevelOnePage, ReferralError> {
        let page = page_no.max(1);
        let page_size = page_size.clamp(1, self.config.max_page_size.max(1));
        let offset = (page - 1).saturating_mul(page_size);

        self.db.with_conn(|conn| {
            nodes::require_node(conn, node_id)?;
            let total = closure::count_direct_children(conn, node_id)?;
            let children = closure::direct_children_page(conn, node_id, offset, page_size)?;

            let owner_ids: Vec<String> = children
                .iter()
                .filter_map(|n| n.owner_identity_id.clone())
                .collect();
            let mut owners = self.identities.summaries(conn, &owner_ids)?;

            let mut items = Vec::with_capacity(children.len());
            for child in children {
                let direct_referrals = closure::count_direct_children(conn, &child.id)?;
                let total_downline = closure::count_descendants(conn, &child.id)?;
                let lead = leads::latest_for_submitter_node(conn, &child.id)?;
                let owner = child.owner_identity_id.as_ref().and_then(|id| owners.remove(id));

                items.push(LevelOneEntry {
                    lead_status: lead.as_ref().map(|l| l.status.clone()),
                    referral_potential: referral_potential::for_direct_children(direct_referrals),
                    node: child,
                    owner,
                    direct_referrals,
                    total_downline,
                    lead,
                });
            }

            Ok(LevelOnePage {
                items,
                page,
                page_size,
                total,
                total_pages: (total + page_size - 1) / page_size,
            })
        })
    }

    /// Active nodes of a page ranked by performance score
    ///
    /// Ties are broken by handle. Statistics still count inactive
    /// descendants.
    pub fn leaderboard(&self, page_id: &str, limit: usize) -> Result<Vec<LeaderboardEntry>, ReferralError> {
        let (page_nodes, edges) = self.db.with_conn(|conn| {
            let page_nodes = nodes::list_nodes_for_page(conn, page_id, false)?;
            let edges = closure::edges_for_page(conn, page_id)?;
            Ok((page_nodes, edges))
        })?;

        let by_id: HashMap<&str, &Node> = page_nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut below: HashMap<&str, Vec<RelatedNode>> = HashMap::new();
        for edge in edges.iter().filter(|e| e.depth > 0) {
            if let Some(node) = by_id.get(edge.descendant_id.as_str()) {
                below.entry(edge.ancestor_id.as_str()).or_default().push(RelatedNode {
                    node: (*node).clone(),
                    depth: edge.depth,
                });
            }
        }

        let mut ranked: Vec<(f64, &Node, SubtreeStatistics)> = page_nodes
            .iter()
            .filter(|n| n.active)
            .map(|node| {
                let descendants = below.get(node.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                let statistics = compute_statistics(node, descendants);
                (score_from_statistics(&statistics), node, statistics)
            })
            .collect();

        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.handle.cmp(&b.1.handle)));

        Ok(ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, (score, node, statistics))| LeaderboardEntry {
                rank: i + 1,
                node: node.clone(),
                score,
                statistics,
            })
            .collect())
    }
}
