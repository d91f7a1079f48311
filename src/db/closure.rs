//! Closure store - the ancestor/descendant index over referral nodes
//!
//! Every node has a depth-0 self-edge, and for each pair of nodes on the same
//! chain there is exactly one row carrying their distance. The index is kept
//! complete on write, so hierarchy reads are single indexed queries:
//!
//! ```text
//! alice ── bob ── carol
//!
//! (alice, alice, 0) (alice, bob, 1) (alice, carol, 2)
//! (bob,   bob,   0) (bob,   carol, 1)
//! (carol, carol, 0)
//! ```
//!
//! Edge writes are upserts keyed on (ancestor, descendant): writing an
//! existing pair replaces its depth instead of failing or duplicating it.
//! Nothing here opens or commits a transaction.

use std::collections::{HashMap, HashSet};

use diesel::prelude::*;
use tracing::debug;

use super::diesel_schema::{closure_edges, referral_nodes};
use super::models::{ClosureEdge, Node, RelatedNode};
use super::nodes;
use crate::error::ReferralError;

// ============================================================================
// Edge Primitives
// ============================================================================

/// Insert the depth-0 edge of a freshly created node
pub fn insert_self_edge(conn: &mut SqliteConnection, node_id: &str) -> Result<(), ReferralError> {
    diesel::insert_into(closure_edges::table)
        .values(&ClosureEdge {
            ancestor_id: node_id.to_string(),
            descendant_id: node_id.to_string(),
            depth: 0,
        })
        .execute(conn)?;
    Ok(())
}

/// Create the self-edge if it is missing; returns whether one was written
pub fn ensure_self_edge(conn: &mut SqliteConnection, node_id: &str) -> Result<bool, ReferralError> {
    if self_edge_count(conn, node_id)? > 0 {
        return Ok(false);
    }
    upsert_edge(conn, node_id, node_id, 0)?;
    Ok(true)
}

/// Number of self-edges recorded for a node (always 1 for a healthy node)
pub fn self_edge_count(conn: &mut SqliteConnection, node_id: &str) -> Result<i64, ReferralError> {
    closure_edges::table
        .filter(closure_edges::ancestor_id.eq(node_id))
        .filter(closure_edges::descendant_id.eq(node_id))
        .filter(closure_edges::depth.eq(0))
        .count()
        .get_result(conn)
        .map_err(|e| ReferralError::Internal(format!("Count query failed: {}", e)))
}

/// Write an edge, replacing the depth of an existing (ancestor, descendant) pair
pub fn upsert_edge(
    conn: &mut SqliteConnection,
    ancestor_id: &str,
    descendant_id: &str,
    depth: i32,
) -> Result<(), ReferralError> {
    diesel::insert_into(closure_edges::table)
        .values((
            closure_edges::ancestor_id.eq(ancestor_id),
            closure_edges::descendant_id.eq(descendant_id),
            closure_edges::depth.eq(depth),
        ))
        .on_conflict((closure_edges::ancestor_id, closure_edges::descendant_id))
        .do_update()
        .set(closure_edges::depth.eq(depth))
        .execute(conn)?;
    Ok(())
}

/// Get a single edge
pub fn get_edge(
    conn: &mut SqliteConnection,
    ancestor_id: &str,
    descendant_id: &str,
) -> Result<Option<ClosureEdge>, ReferralError> {
    closure_edges::table
        .filter(closure_edges::ancestor_id.eq(ancestor_id))
        .filter(closure_edges::descendant_id.eq(descendant_id))
        .select(ClosureEdge::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Edges pointing at `node_id` from strict ancestors
fn ancestor_edges(conn: &mut SqliteConnection, node_id: &str) -> Result<Vec<ClosureEdge>, ReferralError> {
    closure_edges::table
        .filter(closure_edges::descendant_id.eq(node_id))
        .filter(closure_edges::depth.gt(0))
        .order(closure_edges::depth.asc())
        .select(ClosureEdge::as_select())
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Edges leaving `node_id` towards strict descendants
fn descendant_edges(conn: &mut SqliteConnection, node_id: &str) -> Result<Vec<ClosureEdge>, ReferralError> {
    closure_edges::table
        .filter(closure_edges::ancestor_id.eq(node_id))
        .filter(closure_edges::depth.gt(0))
        .order(closure_edges::depth.asc())
        .select(ClosureEdge::as_select())
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

// ============================================================================
// Read Operations
// ============================================================================

/// Strict ancestors of a node, nearest first
pub fn ancestors_of(conn: &mut SqliteConnection, node_id: &str) -> Result<Vec<RelatedNode>, ReferralError> {
    nodes::require_node(conn, node_id)?;

    let rows: Vec<(Node, i32)> = closure_edges::table
        .inner_join(referral_nodes::table.on(referral_nodes::id.eq(closure_edges::ancestor_id)))
        .filter(closure_edges::descendant_id.eq(node_id))
        .filter(closure_edges::depth.gt(0))
        .order((closure_edges::depth.asc(), referral_nodes::handle.asc()))
        .select((Node::as_select(), closure_edges::depth))
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))?;

    Ok(rows.into_iter().map(|(node, depth)| RelatedNode { node, depth }).collect())
}

/// Strict descendants of a node, nearest first (ties by handle)
pub fn descendants_of(conn: &mut SqliteConnection, node_id: &str) -> Result<Vec<RelatedNode>, ReferralError> {
    nodes::require_node(conn, node_id)?;

    let rows: Vec<(Node, i32)> = closure_edges::table
        .inner_join(referral_nodes::table.on(referral_nodes::id.eq(closure_edges::descendant_id)))
        .filter(closure_edges::ancestor_id.eq(node_id))
        .filter(closure_edges::depth.gt(0))
        .order((closure_edges::depth.asc(), referral_nodes::handle.asc()))
        .select((Node::as_select(), closure_edges::depth))
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))?;

    Ok(rows.into_iter().map(|(node, depth)| RelatedNode { node, depth }).collect())
}

/// Nodes exactly one hop below `node_id`
pub fn direct_children_of(conn: &mut SqliteConnection, node_id: &str) -> Result<Vec<Node>, ReferralError> {
    nodes::require_node(conn, node_id)?;
    direct_children_page(conn, node_id, 0, i64::MAX)
}

/// One page of direct children, ordered by creation then handle
pub fn direct_children_page(
    conn: &mut SqliteConnection,
    node_id: &str,
    offset: i64,
    limit: i64,
) -> Result<Vec<Node>, ReferralError> {
    closure_edges::table
        .inner_join(referral_nodes::table.on(referral_nodes::id.eq(closure_edges::descendant_id)))
        .filter(closure_edges::ancestor_id.eq(node_id))
        .filter(closure_edges::depth.eq(1))
        .order((referral_nodes::created_at.asc(), referral_nodes::handle.asc()))
        .select(Node::as_select())
        .limit(limit)
        .offset(offset)
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Number of nodes exactly one hop below `node_id`
pub fn count_direct_children(conn: &mut SqliteConnection, node_id: &str) -> Result<i64, ReferralError> {
    closure_edges::table
        .filter(closure_edges::ancestor_id.eq(node_id))
        .filter(closure_edges::depth.eq(1))
        .count()
        .get_result(conn)
        .map_err(|e| ReferralError::Internal(format!("Count query failed: {}", e)))
}

/// Size of the whole downline below `node_id`
pub fn count_descendants(conn: &mut SqliteConnection, node_id: &str) -> Result<i64, ReferralError> {
    closure_edges::table
        .filter(closure_edges::ancestor_id.eq(node_id))
        .filter(closure_edges::depth.gt(0))
        .count()
        .get_result(conn)
        .map_err(|e| ReferralError::Internal(format!("Count query failed: {}", e)))
}

/// Whether `candidate_id` sits strictly below `ancestor_id`
pub fn is_descendant(
    conn: &mut SqliteConnection,
    ancestor_id: &str,
    candidate_id: &str,
) -> Result<bool, ReferralError> {
    Ok(get_edge(conn, ancestor_id, candidate_id)?
        .map(|edge| edge.depth > 0)
        .unwrap_or(false))
}

/// Whether a node has any upline at all
pub fn has_ancestry(conn: &mut SqliteConnection, node_id: &str) -> Result<bool, ReferralError> {
    let count: i64 = closure_edges::table
        .filter(closure_edges::descendant_id.eq(node_id))
        .filter(closure_edges::depth.gt(0))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// The node one hop above, if any
pub fn parent_of(conn: &mut SqliteConnection, node_id: &str) -> Result<Option<Node>, ReferralError> {
    closure_edges::table
        .inner_join(referral_nodes::table.on(referral_nodes::id.eq(closure_edges::ancestor_id)))
        .filter(closure_edges::descendant_id.eq(node_id))
        .filter(closure_edges::depth.eq(1))
        .select(Node::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

// ============================================================================
// Write Operations
// ============================================================================

/// Attach a node without upline under `parent_id`
///
/// Writes (parent, child, 1) and (x, child, d + 1) for every (x, parent, d).
/// A child that already has an upline is rejected with `AlreadyAttached`;
/// moving it is the reassignment operation's job. Both nodes must be on the
/// same page.
pub fn attach(conn: &mut SqliteConnection, child_id: &str, parent_id: &str) -> Result<usize, ReferralError> {
    nodes::require_node(conn, child_id)?;
    nodes::require_node(conn, parent_id)?;

    if child_id == parent_id || is_descendant(conn, child_id, parent_id)? {
        return Err(ReferralError::CycleDetected {
            node_id: child_id.to_string(),
            parent_id: parent_id.to_string(),
        });
    }
    if has_ancestry(conn, child_id)? {
        return Err(ReferralError::AlreadyAttached(child_id.to_string()));
    }

    graft(conn, child_id, parent_id)
}

/// Link `node_id` and its whole subtree below `parent_id`
///
/// Both nodes must live on the same page (`PageMismatch` otherwise). Callers
/// have already ruled out cycles. Returns the number of edges written.
pub(crate) fn graft(conn: &mut SqliteConnection, node_id: &str, parent_id: &str) -> Result<usize, ReferralError> {
    let node = nodes::require_node(conn, node_id)?;
    let parent = nodes::require_node(conn, parent_id)?;
    if node.page_id != parent.page_id {
        return Err(ReferralError::PageMismatch {
            node_id: node.id,
            node_page: node.page_id,
            parent_id: parent.id,
            parent_page: parent.page_id,
        });
    }

    let mut uplink: Vec<(String, i32)> = vec![(parent_id.to_string(), 0)];
    uplink.extend(
        ancestor_edges(conn, parent_id)?
            .into_iter()
            .map(|edge| (edge.ancestor_id, edge.depth)),
    );

    let mut subtree: Vec<(String, i32)> = vec![(node_id.to_string(), 0)];
    subtree.extend(
        descendant_edges(conn, node_id)?
            .into_iter()
            .map(|edge| (edge.descendant_id, edge.depth)),
    );

    let mut written = 0;
    for (ancestor_id, above) in &uplink {
        for (descendant_id, below) in &subtree {
            upsert_edge(conn, ancestor_id, descendant_id, above + 1 + below)?;
            written += 1;
        }
    }

    debug!(node_id, parent_id, edges = written, "Node attached");
    Ok(written)
}

/// Remove the upline of `node_id` and of everything below it
///
/// Deletes every edge (a, s) where a is a strict ancestor of the node and s
/// is the node or one of its descendants. Edges inside the subtree and the
/// self-edge stay. Returns the number of edges removed.
pub fn detach_ancestry(conn: &mut SqliteConnection, node_id: &str) -> Result<usize, ReferralError> {
    let ancestor_ids: Vec<String> = ancestor_edges(conn, node_id)?
        .into_iter()
        .map(|edge| edge.ancestor_id)
        .collect();
    if ancestor_ids.is_empty() {
        return Ok(0);
    }

    let mut subtree_ids: Vec<String> = vec![node_id.to_string()];
    subtree_ids.extend(
        descendant_edges(conn, node_id)?
            .into_iter()
            .map(|edge| edge.descendant_id),
    );

    let removed = diesel::delete(
        closure_edges::table
            .filter(closure_edges::ancestor_id.eq_any(&ancestor_ids))
            .filter(closure_edges::descendant_id.eq_any(&subtree_ids)),
    )
    .execute(conn)?;

    debug!(node_id, removed, "Node ancestry detached");
    Ok(removed)
}

// ============================================================================
// Integrity
// ============================================================================

/// Every edge whose descendant lives on `page_id`, self-edges included
pub fn edges_for_page(conn: &mut SqliteConnection, page_id: &str) -> Result<Vec<ClosureEdge>, ReferralError> {
    closure_edges::table
        .inner_join(referral_nodes::table.on(referral_nodes::id.eq(closure_edges::descendant_id)))
        .filter(referral_nodes::page_id.eq(page_id))
        .select(ClosureEdge::as_select())
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Check the closure invariants over all edges of a page
///
/// Returns a description of each violation: nodes without exactly one
/// self-edge, and pairs (a, b, d1), (b, c, d2) lacking (a, c, d1 + d2).
pub fn closure_violations(conn: &mut SqliteConnection, page_id: &str) -> Result<Vec<String>, ReferralError> {
    let page_nodes = nodes::list_nodes_for_page(conn, page_id, false)?;
    let edges = edges_for_page(conn, page_id)?;

    let mut violations = Vec::new();

    let mut self_edges: HashMap<&str, usize> = HashMap::new();
    for edge in edges.iter().filter(|e| e.ancestor_id == e.descendant_id) {
        *self_edges.entry(edge.ancestor_id.as_str()).or_default() += 1;
        if edge.depth != 0 {
            violations.push(format!("self-edge of {} has depth {}", edge.ancestor_id, edge.depth));
        }
    }
    for node in &page_nodes {
        let count = self_edges.get(node.id.as_str()).copied().unwrap_or(0);
        if count != 1 {
            violations.push(format!("node {} has {} self-edges", node.id, count));
        }
    }

    let index: HashMap<(&str, &str), i32> = edges
        .iter()
        .map(|e| ((e.ancestor_id.as_str(), e.descendant_id.as_str()), e.depth))
        .collect();
    let mut below: HashMap<&str, Vec<&ClosureEdge>> = HashMap::new();
    for edge in edges.iter().filter(|e| e.depth > 0) {
        below.entry(edge.ancestor_id.as_str()).or_default().push(edge);
    }

    let mut reported: HashSet<(&str, &str)> = HashSet::new();
    for first in edges.iter().filter(|e| e.depth > 0) {
        for second in below.get(first.descendant_id.as_str()).into_iter().flatten() {
            let key = (first.ancestor_id.as_str(), second.descendant_id.as_str());
            let expected = first.depth + second.depth;
            if index.get(&key) != Some(&expected) && reported.insert(key) {
                violations.push(format!(
                    "missing edge ({}, {}, {})",
                    key.0, key.1, expected
                ));
            }
        }
    }

    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nodes::{create_node, HandlePolicy};
    use crate::db::{pages, schema::init_schema};
    use diesel::Connection;

    fn setup_test_db() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:").expect("Failed to create in-memory database");
        init_schema(&mut conn).expect("Failed to create schema");
        pages::create_page(&mut conn, "page-1", None, "Landing").unwrap();
        conn
    }

    fn node(conn: &mut SqliteConnection, handle: &str) -> Node {
        create_node(conn, &HandlePolicy::default(), "page-1", None, Some(handle)).unwrap()
    }

    fn handles(related: &[RelatedNode]) -> Vec<(String, i32)> {
        related.iter().map(|r| (r.node.handle.clone(), r.depth)).collect()
    }

    #[test]
    fn test_attach_builds_transitive_edges() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        let bob = node(&mut conn, "bob");
        let carol = node(&mut conn, "carol");

        attach(&mut conn, &bob.id, &alice.id).unwrap();
        let written = attach(&mut conn, &carol.id, &bob.id).unwrap();
        assert_eq!(written, 2);

        assert_eq!(
            handles(&ancestors_of(&mut conn, &carol.id).unwrap()),
            vec![("bob".to_string(), 1), ("alice".to_string(), 2)]
        );
        assert_eq!(
            handles(&descendants_of(&mut conn, &alice.id).unwrap()),
            vec![("bob".to_string(), 1), ("carol".to_string(), 2)]
        );
        assert!(closure_violations(&mut conn, "page-1").unwrap().is_empty());
    }

    #[test]
    fn test_direct_children_only_depth_one() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        let bob = node(&mut conn, "bob");
        let dan = node(&mut conn, "dan");
        let carol = node(&mut conn, "carol");
        attach(&mut conn, &bob.id, &alice.id).unwrap();
        attach(&mut conn, &dan.id, &alice.id).unwrap();
        attach(&mut conn, &carol.id, &bob.id).unwrap();

        let children: Vec<String> = direct_children_of(&mut conn, &alice.id)
            .unwrap()
            .into_iter()
            .map(|n| n.handle)
            .collect();
        assert_eq!(children.len(), 2);
        assert!(children.contains(&"bob".to_string()));
        assert!(children.contains(&"dan".to_string()));
        assert_eq!(count_direct_children(&mut conn, &alice.id).unwrap(), 2);
        assert_eq!(count_descendants(&mut conn, &alice.id).unwrap(), 3);
        assert_eq!(parent_of(&mut conn, &carol.id).unwrap().unwrap().id, bob.id);
        assert!(parent_of(&mut conn, &alice.id).unwrap().is_none());
    }

    #[test]
    fn test_attach_rejects_second_upline() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        let bob = node(&mut conn, "bob");
        let carol = node(&mut conn, "carol");
        attach(&mut conn, &carol.id, &alice.id).unwrap();

        let err = attach(&mut conn, &carol.id, &bob.id).unwrap_err();
        assert!(matches!(err, ReferralError::AlreadyAttached(_)));
        assert!(get_edge(&mut conn, &bob.id, &carol.id).unwrap().is_none());
    }

    #[test]
    fn test_attach_rejects_cycles() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        let bob = node(&mut conn, "bob");
        attach(&mut conn, &bob.id, &alice.id).unwrap();

        assert!(matches!(
            attach(&mut conn, &alice.id, &bob.id),
            Err(ReferralError::CycleDetected { .. })
        ));
        assert!(matches!(
            attach(&mut conn, &alice.id, &alice.id),
            Err(ReferralError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_attach_unknown_node() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        assert!(matches!(
            attach(&mut conn, "missing", &alice.id),
            Err(ReferralError::NodeNotFound(_))
        ));
        assert!(matches!(
            attach(&mut conn, &alice.id, "missing"),
            Err(ReferralError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_attach_rejects_other_page() {
        let mut conn = setup_test_db();
        pages::create_page(&mut conn, "page-2", None, "Other").unwrap();
        let alice = node(&mut conn, "alice");
        let bob = create_node(&mut conn, &HandlePolicy::default(), "page-2", None, Some("bob")).unwrap();

        let err = attach(&mut conn, &bob.id, &alice.id).unwrap_err();
        match err {
            ReferralError::PageMismatch { node_page, parent_page, .. } => {
                assert_eq!(node_page, "page-2");
                assert_eq!(parent_page, "page-1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(get_edge(&mut conn, &alice.id, &bob.id).unwrap().is_none());
        assert!(descendants_of(&mut conn, &alice.id).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_replaces_depth_without_duplicates() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        let bob = node(&mut conn, "bob");

        upsert_edge(&mut conn, &alice.id, &bob.id, 1).unwrap();
        upsert_edge(&mut conn, &alice.id, &bob.id, 3).unwrap();

        let count: i64 = closure_edges::table
            .filter(closure_edges::ancestor_id.eq(&alice.id))
            .filter(closure_edges::descendant_id.eq(&bob.id))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(get_edge(&mut conn, &alice.id, &bob.id).unwrap().unwrap().depth, 3);
    }

    #[test]
    fn test_attach_root_with_subtree_grafts_it() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        let bob = node(&mut conn, "bob");
        let carol = node(&mut conn, "carol");
        attach(&mut conn, &carol.id, &bob.id).unwrap();

        // bob is a root with a child; attaching him carries carol along
        attach(&mut conn, &bob.id, &alice.id).unwrap();
        assert_eq!(get_edge(&mut conn, &alice.id, &carol.id).unwrap().unwrap().depth, 2);
        assert!(closure_violations(&mut conn, "page-1").unwrap().is_empty());
    }

    #[test]
    fn test_detach_and_ensure_self_edge() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        let bob = node(&mut conn, "bob");
        let carol = node(&mut conn, "carol");
        attach(&mut conn, &bob.id, &alice.id).unwrap();
        attach(&mut conn, &carol.id, &bob.id).unwrap();

        let removed = detach_ancestry(&mut conn, &bob.id).unwrap();
        assert_eq!(removed, 2);
        assert!(!has_ancestry(&mut conn, &bob.id).unwrap());
        assert_eq!(get_edge(&mut conn, &bob.id, &carol.id).unwrap().unwrap().depth, 1);
        assert_eq!(count_descendants(&mut conn, &alice.id).unwrap(), 0);

        assert!(!ensure_self_edge(&mut conn, &bob.id).unwrap());
        diesel::delete(
            closure_edges::table
                .filter(closure_edges::ancestor_id.eq(&bob.id))
                .filter(closure_edges::descendant_id.eq(&bob.id)),
        )
        .execute(&mut conn)
        .unwrap();
        assert!(ensure_self_edge(&mut conn, &bob.id).unwrap());
        assert_eq!(self_edge_count(&mut conn, &bob.id).unwrap(), 1);
    }

    #[test]
    fn test_closure_violations_reports_missing_edge() {
        let mut conn = setup_test_db();
        let alice = node(&mut conn, "alice");
        let bob = node(&mut conn, "bob");
        let carol = node(&mut conn, "carol");
        upsert_edge(&mut conn, &alice.id, &bob.id, 1).unwrap();
        upsert_edge(&mut conn, &bob.id, &carol.id, 1).unwrap();

        let violations = closure_violations(&mut conn, "page-1").unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains(&carol.id));
    }
}
