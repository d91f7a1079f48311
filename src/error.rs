//! Error types for referral-store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReferralError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// A page that is missing or inactive. Lookups of a page are the page
    /// counterpart of `NodeNotFound`; callers treating both as "not found"
    /// should match on either variant.
    #[error("Page not found or inactive: {0}")]
    PageUnavailable(String),

    #[error("Lead not found: {0}")]
    LeadNotFound(String),

    /// Raised inside the ingestion transaction and recovered into
    /// `LeadResult::Conflict` by the attribution service.
    #[error("Lead already submitted for this page: {existing_lead_id}")]
    DuplicateLead { existing_lead_id: String },

    #[error("Node already exists for owner {owner_identity_id} on page {page_id}")]
    DuplicateOwnerNode {
        page_id: String,
        owner_identity_id: String,
    },

    #[error("Could not generate a free handle on page {page_id} after {attempts} attempts")]
    HandleCollisionExhausted { page_id: String, attempts: u32 },

    #[error("Handle already taken on page {page_id}: {handle}")]
    HandleTaken { page_id: String, handle: String },

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Node already has an upline: {0}")]
    AlreadyAttached(String),

    #[error("Invalid reassignment: {0}")]
    InvalidReassignment(String),

    #[error("Node {node_id} (page {node_page}) cannot be linked under {parent_id} (page {parent_page})")]
    PageMismatch {
        node_id: String,
        node_page: String,
        parent_id: String,
        parent_page: String,
    },

    #[error("Attaching {node_id} under {parent_id} would create a cycle")]
    CycleDetected { node_id: String, parent_id: String },

    #[error("Invalid lead status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(#[from] diesel::result::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReferralError {
    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReferralError::TransactionFailed(_) | ReferralError::Connection(_)
        )
    }
}
