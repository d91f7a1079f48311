//! Diesel model definitions for database tables
//!
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT queries (writing data)

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::diesel_schema::*;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ============================================================================
// Referral Node Models
// ============================================================================

/// One referral position within one page
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = referral_nodes)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Node {
    pub id: String,
    pub page_id: String,
    pub owner_identity_id: Option<String>,
    pub handle: String,
    pub click_count: i64,
    pub lead_count: i64,
    pub active: bool,
    pub created_at: String,
}

/// New node for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = referral_nodes)]
pub struct NewNode<'a> {
    pub id: &'a str,
    pub page_id: &'a str,
    pub owner_identity_id: Option<&'a str>,
    pub handle: &'a str,
    pub click_count: i64,
    pub lead_count: i64,
    pub active: bool,
    pub created_at: &'a str,
}

/// A node paired with its distance from the node a query started at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedNode {
    pub node: Node,
    pub depth: i32,
}

// ============================================================================
// Closure Models
// ============================================================================

/// Ancestor/descendant pair of the closure table
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = closure_edges)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ClosureEdge {
    pub ancestor_id: String,
    pub descendant_id: String,
    pub depth: i32,
}

// ============================================================================
// Lead Models
// ============================================================================

/// Lead row from SELECT query
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = leads)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Lead {
    pub id: String,
    pub page_id: String,
    pub referrer_node_id: String,
    pub submitter_node_id: String,
    pub submitter_identity_id: String,
    pub submitter_email: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

/// New lead for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = leads)]
pub struct NewLead<'a> {
    pub id: &'a str,
    pub page_id: &'a str,
    pub referrer_node_id: &'a str,
    pub submitter_node_id: &'a str,
    pub submitter_identity_id: &'a str,
    pub submitter_email: &'a str,
    pub status: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

// ============================================================================
// Collaborator Models
// ============================================================================

/// Identity row from SELECT query
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = identities)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub must_reset_credential: bool,
    pub created_at: String,
}

/// New identity for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = identities)]
pub struct NewIdentity<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub display_name: &'a str,
    pub phone: Option<&'a str>,
    pub credential_hash: &'a str,
    pub must_reset_credential: bool,
    pub created_at: &'a str,
}

/// Display data joined onto tree listings
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = identities)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct IdentitySummary {
    pub id: String,
    pub display_name: String,
    pub email: String,
}

/// Page row from SELECT query
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = pages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Page {
    pub id: String,
    pub owner_identity_id: Option<String>,
    pub title: String,
    pub active: bool,
    pub view_count: i64,
    pub created_at: String,
}

/// New page for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = pages)]
pub struct NewPage<'a> {
    pub id: &'a str,
    pub owner_identity_id: Option<&'a str>,
    pub title: &'a str,
    pub active: bool,
    pub view_count: i64,
    pub created_at: &'a str,
}

// ============================================================================
// Lead Status Constants
// ============================================================================

/// Lead status values and the transitions allowed between them
///
/// ```text
/// new -> contacted -> joined
/// *   -> joining_link_shared -> advertisement_link_shared
/// ```
pub mod lead_status {
    pub const NEW: &str = "new";
    pub const CONTACTED: &str = "contacted";
    pub const JOINED: &str = "joined";
    pub const JOINING_LINK_SHARED: &str = "joining_link_shared";
    pub const ADVERTISEMENT_LINK_SHARED: &str = "advertisement_link_shared";

    pub const ALL: [&str; 5] = [
        NEW,
        CONTACTED,
        JOINED,
        JOINING_LINK_SHARED,
        ADVERTISEMENT_LINK_SHARED,
    ];

    /// Check if a status is valid
    pub fn is_valid(status: &str) -> bool {
        ALL.contains(&status)
    }

    /// Whether a lead in `from` may move to `to`
    pub fn can_transition(from: &str, to: &str) -> bool {
        if !is_valid(from) || !is_valid(to) || from == to {
            return false;
        }
        match to {
            CONTACTED => from == NEW,
            JOINED => from == CONTACTED,
            JOINING_LINK_SHARED => true,
            ADVERTISEMENT_LINK_SHARED => from == JOINING_LINK_SHARED,
            _ => false,
        }
    }
}

// ============================================================================
// Referral Potential Tiers
// ============================================================================

/// Tier labels derived from a node's direct-child count
pub mod referral_potential {
    pub const NEW: &str = "New";
    pub const LOW: &str = "Low";
    pub const MEDIUM: &str = "Medium";
    pub const HIGH: &str = "High";
    pub const EXPERT: &str = "Expert";

    pub fn for_direct_children(count: i64) -> &'static str {
        match count {
            i64::MIN..=0 => NEW,
            1..=2 => LOW,
            3..=5 => MEDIUM,
            6..=10 => HIGH,
            _ => EXPERT,
        }
    }
}
