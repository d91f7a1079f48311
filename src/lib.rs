//! Referral Store - referral attribution over a closure-table hierarchy
//!
//! Each landing page carries a tree of referral nodes. A capture-form
//! submission is attributed to the node behind the link the applicant
//! followed, and the applicant gets a node of their own one level below it.
//!
//! ## Storage
//!
//! The hierarchy is kept as a closure table: one row per ancestor/descendant
//! pair with its distance, plus a depth-0 row per node. Upline, downline and
//! per-level statistics are single indexed reads.
//!
//! ```text
//! ~/.local/share/referral-store/
//! ├── referrals.db           # SQLite (nodes, closure edges, leads)
//! └── config.toml            # Configuration
//! ```
//!
//! ## Layers
//!
//! - `db` - Diesel repository functions taking an explicit connection
//! - `services` - Transactions, validation and post-commit events

pub mod config;
pub mod db;
pub mod error;
pub mod services;

// Re-exports
pub use config::Config;
pub use db::{OperatorContext, ReferralDb};
pub use error::ReferralError;
pub use services::{
    Applicant, AttributionService, EventBus, LeadResult, ReassignmentService, ReferralEvent, Services, TreeService,
};
