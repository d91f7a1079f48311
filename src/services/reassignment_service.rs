//! Reassignment service - move a node (and its downline) under a new parent
//!
//! The node keeps its own subtree: descendants stay at the same distance
//! from it, and everything moves together under the new parent. The whole
//! edge rewrite happens in one immediate transaction.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::db::models::Node;
use crate::db::{closure, nodes, OperatorContext, ReferralDb};
use crate::error::ReferralError;

use super::events::{EventBus, ReferralEvent};

/// What a reassignment changed
#[derive(Debug, Clone, Serialize)]
pub struct ReassignmentOutcome {
    pub node: Node,
    pub old_parent_id: Option<String>,
    pub new_parent: Node,
    /// Upline edges deleted for the node and its subtree
    pub edges_removed: usize,
    /// Edges written linking the subtree to its new upline
    pub edges_written: usize,
}

/// Administrative re-parenting of referral nodes
pub struct ReassignmentService {
    db: Arc<ReferralDb>,
    events: Arc<EventBus>,
}

impl ReassignmentService {
    /// Create a new reassignment service
    pub fn new(db: Arc<ReferralDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Re-parent `node_id` under `new_parent_id`
    ///
    /// Rejected when the two are the same node, live on different pages
    /// (`PageMismatch`, raised by the graft), or the new parent sits inside
    /// the node's subtree. A rejection leaves no edge changed.
    /// Reassigning under the current parent rewrites the same edges.
    pub fn reassign(
        &self,
        operator: &OperatorContext,
        node_id: &str,
        new_parent_id: &str,
    ) -> Result<ReassignmentOutcome, ReferralError> {
        if node_id == new_parent_id {
            return Err(ReferralError::InvalidReassignment(format!(
                "node {} cannot be its own parent",
                node_id
            )));
        }

        let outcome = self.db.transaction(|conn| {
            let node = nodes::require_node(conn, node_id)?;
            let new_parent = nodes::require_node(conn, new_parent_id)?;

            if closure::is_descendant(conn, node_id, new_parent_id)? {
                return Err(ReferralError::CycleDetected {
                    node_id: node_id.to_string(),
                    parent_id: new_parent_id.to_string(),
                });
            }

            let old_parent_id = closure::parent_of(conn, node_id)?.map(|p| p.id);
            let edges_removed = closure::detach_ancestry(conn, node_id)?;
            closure::ensure_self_edge(conn, node_id)?;
            let edges_written = closure::graft(conn, node_id, new_parent_id)?;

            Ok(ReassignmentOutcome {
                node,
                old_parent_id,
                new_parent,
                edges_removed,
                edges_written,
            })
        })?;

        info!(
            node_id,
            old_parent = ?outcome.old_parent_id,
            new_parent = new_parent_id,
            removed = outcome.edges_removed,
            written = outcome.edges_written,
            actor = %operator.actor_id,
            "Node reassigned"
        );
        self.events.emit(ReferralEvent::NodeReassigned {
            node_id: outcome.node.id.clone(),
            old_parent_id: outcome.old_parent_id.clone(),
            new_parent_id: outcome.new_parent.id.clone(),
            actor_id: operator.actor_id.clone(),
        });

        Ok(outcome)
    }
}
