//! Node registry - referral nodes and their handles
//!
//! A node is one referral position on one page. Nodes are created lazily and
//! always together with their depth-0 self-edge.

use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use super::closure;
use super::diesel_schema::referral_nodes;
use super::models::{current_timestamp, NewNode, Node};
use crate::config::Config;
use crate::error::ReferralError;

/// Characters used in generated handles (no 0/o/1/l look-alikes)
const HANDLE_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyz23456789";

const MAX_HANDLE_LEN: usize = 64;

/// How generated handles are shaped and how hard to look for a free one
#[derive(Debug, Clone, Copy)]
pub struct HandlePolicy {
    pub length: usize,
    pub max_attempts: u32,
}

impl Default for HandlePolicy {
    fn default() -> Self {
        Self {
            length: 8,
            max_attempts: 20,
        }
    }
}

impl From<&Config> for HandlePolicy {
    fn from(config: &Config) -> Self {
        Self {
            length: config.handle_length,
            max_attempts: config.max_handle_attempts,
        }
    }
}

/// Lowercase and check a caller-supplied handle
pub fn validate_handle(handle: &str) -> Result<String, ReferralError> {
    let handle = handle.trim().to_lowercase();
    if handle.is_empty() || handle.len() > MAX_HANDLE_LEN {
        return Err(ReferralError::InvalidHandle(format!(
            "handle must be 1-{} characters",
            MAX_HANDLE_LEN
        )));
    }
    if !handle
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(ReferralError::InvalidHandle(format!(
            "'{}' may only contain a-z, 0-9, '-' and '_'",
            handle
        )));
    }
    Ok(handle)
}

/// Random handle of `length` characters
pub fn generate_handle(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| HANDLE_ALPHABET[rng.gen_range(0..HANDLE_ALPHABET.len())] as char)
        .collect()
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get node by ID
pub fn get_node(conn: &mut SqliteConnection, node_id: &str) -> Result<Option<Node>, ReferralError> {
    referral_nodes::table
        .filter(referral_nodes::id.eq(node_id))
        .select(Node::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Get node by ID, failing with `NodeNotFound`
pub fn require_node(conn: &mut SqliteConnection, node_id: &str) -> Result<Node, ReferralError> {
    get_node(conn, node_id)?.ok_or_else(|| ReferralError::NodeNotFound(node_id.to_string()))
}

/// Find a node by handle within a page, active or not
pub fn find_by_handle(
    conn: &mut SqliteConnection,
    page_id: &str,
    handle: &str,
) -> Result<Option<Node>, ReferralError> {
    referral_nodes::table
        .filter(referral_nodes::page_id.eq(page_id))
        .filter(referral_nodes::handle.eq(handle))
        .select(Node::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Find the node an identity owns on a page
pub fn find_by_owner(
    conn: &mut SqliteConnection,
    page_id: &str,
    owner_identity_id: &str,
) -> Result<Option<Node>, ReferralError> {
    referral_nodes::table
        .filter(referral_nodes::page_id.eq(page_id))
        .filter(referral_nodes::owner_identity_id.eq(owner_identity_id))
        .select(Node::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// List nodes of a page, oldest first
pub fn list_nodes_for_page(
    conn: &mut SqliteConnection,
    page_id: &str,
    active_only: bool,
) -> Result<Vec<Node>, ReferralError> {
    let mut query = referral_nodes::table
        .filter(referral_nodes::page_id.eq(page_id))
        .into_boxed();

    if active_only {
        query = query.filter(referral_nodes::active.eq(true));
    }

    query
        .order((referral_nodes::created_at.asc(), referral_nodes::handle.asc()))
        .select(Node::as_select())
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

// ============================================================================
// Write Operations
// ============================================================================

/// Create a node and its self-edge
///
/// Without a `handle` a random one is generated, retrying on collisions up to
/// `policy.max_attempts` times. Nodes without an owner are placeholders for
/// handles nobody has claimed yet.
pub fn create_node(
    conn: &mut SqliteConnection,
    policy: &HandlePolicy,
    page_id: &str,
    owner_identity_id: Option<&str>,
    handle: Option<&str>,
) -> Result<Node, ReferralError> {
    if let Some(owner) = owner_identity_id {
        if find_by_owner(conn, page_id, owner)?.is_some() {
            return Err(ReferralError::DuplicateOwnerNode {
                page_id: page_id.to_string(),
                owner_identity_id: owner.to_string(),
            });
        }
    }

    let node_id = Uuid::new_v4().to_string();
    let now = current_timestamp();

    match handle {
        Some(handle) => {
            let handle = validate_handle(handle)?;
            let taken = || ReferralError::HandleTaken {
                page_id: page_id.to_string(),
                handle: handle.clone(),
            };
            if find_by_handle(conn, page_id, &handle)?.is_some() {
                return Err(taken());
            }
            match insert_node(conn, &node_id, page_id, owner_identity_id, &handle, &now) {
                Ok(_) => {}
                Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                    return Err(taken());
                }
                Err(e) => return Err(e.into()),
            }
        }
        None => {
            let mut attempts = 0;
            loop {
                if attempts >= policy.max_attempts {
                    warn!(page_id, attempts, "Handle space exhausted");
                    return Err(ReferralError::HandleCollisionExhausted {
                        page_id: page_id.to_string(),
                        attempts,
                    });
                }
                attempts += 1;

                let candidate = generate_handle(policy.length);
                if find_by_handle(conn, page_id, &candidate)?.is_some() {
                    debug!(page_id, handle = %candidate, "Generated handle collided, retrying");
                    continue;
                }
                match insert_node(conn, &node_id, page_id, owner_identity_id, &candidate, &now) {
                    Ok(_) => break,
                    Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                        debug!(page_id, handle = %candidate, "Handle claimed concurrently, retrying");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    closure::insert_self_edge(conn, &node_id)?;

    let node = require_node(conn, &node_id)?;
    debug!(node_id = %node.id, page_id, handle = %node.handle, "Node created");
    Ok(node)
}

fn insert_node(
    conn: &mut SqliteConnection,
    node_id: &str,
    page_id: &str,
    owner_identity_id: Option<&str>,
    handle: &str,
    created_at: &str,
) -> QueryResult<usize> {
    diesel::insert_into(referral_nodes::table)
        .values(&NewNode {
            id: node_id,
            page_id,
            owner_identity_id,
            handle,
            click_count: 0,
            lead_count: 0,
            active: true,
            created_at,
        })
        .execute(conn)
}

/// Count one click on a node's link
pub fn increment_click_count(conn: &mut SqliteConnection, node_id: &str) -> Result<(), ReferralError> {
    let updated = diesel::update(referral_nodes::table.filter(referral_nodes::id.eq(node_id)))
        .set(referral_nodes::click_count.eq(referral_nodes::click_count + 1))
        .execute(conn)?;
    if updated == 0 {
        return Err(ReferralError::NodeNotFound(node_id.to_string()));
    }
    Ok(())
}

/// Credit one lead to a node
pub fn increment_lead_count(conn: &mut SqliteConnection, node_id: &str) -> Result<(), ReferralError> {
    let updated = diesel::update(referral_nodes::table.filter(referral_nodes::id.eq(node_id)))
        .set(referral_nodes::lead_count.eq(referral_nodes::lead_count + 1))
        .execute(conn)?;
    if updated == 0 {
        return Err(ReferralError::NodeNotFound(node_id.to_string()));
    }
    Ok(())
}

/// Enable or disable a node's link
pub fn set_active(conn: &mut SqliteConnection, node_id: &str, active: bool) -> Result<(), ReferralError> {
    let updated = diesel::update(referral_nodes::table.filter(referral_nodes::id.eq(node_id)))
        .set(referral_nodes::active.eq(active))
        .execute(conn)?;
    if updated == 0 {
        return Err(ReferralError::NodeNotFound(node_id.to_string()));
    }
    Ok(())
}
