//! Service layer for referral-store
//!
//! Services sit between callers (the CLI, an embedding server) and the
//! repository functions in `db`. Each service wraps repository calls with:
//! - Input validation
//! - Transaction boundaries
//! - Event emission after commit
//!
//! ## Architecture
//!
//! ```text
//! Callers (CLI, HTTP handlers)
//!     ↓
//! Service Layer (attribution, tree queries, reassignment)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod attribution_service;
pub mod collaborators;
pub mod events;
pub mod reassignment_service;
pub mod tree_service;

// Re-exports
pub use attribution_service::{AttributionService, LeadReceipt, LeadResult};
pub use collaborators::{
    Applicant, IdentityDirectory, PageDirectory, ResolvedIdentity, SqlIdentityDirectory, SqlPageDirectory,
};
pub use events::{spawn_listener, spawn_logging_listener, EventBus, EventListener, ReferralEvent};
pub use reassignment_service::{ReassignmentOutcome, ReassignmentService};
pub use tree_service::{
    LeaderboardEntry, LevelOneEntry, LevelOnePage, ReferralEntry, SubtreeStatistics, TreeService,
};

use crate::config::Config;
use crate::db::ReferralDb;
use std::sync::Arc;

/// Service container for dependency injection
///
/// Holds all services over one shared database and event bus.
pub struct Services {
    pub attribution: Arc<AttributionService>,
    pub tree: Arc<TreeService>,
    pub reassignment: Arc<ReassignmentService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services with the bundled SQL directories
    pub fn new(db: Arc<ReferralDb>, config: Arc<Config>) -> Self {
        Self::with_directories(
            db,
            config,
            Arc::new(SqlIdentityDirectory),
            Arc::new(SqlPageDirectory),
        )
    }

    /// Create all services with caller-supplied identity and page directories
    pub fn with_directories(
        db: Arc<ReferralDb>,
        config: Arc<Config>,
        identities: Arc<dyn IdentityDirectory>,
        pages: Arc<dyn PageDirectory>,
    ) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));

        Self {
            attribution: Arc::new(AttributionService::new(
                db.clone(),
                events.clone(),
                identities.clone(),
                pages,
                config.clone(),
            )),
            tree: Arc::new(TreeService::new(db.clone(), identities, config)),
            reassignment: Arc::new(ReassignmentService::new(db, events.clone())),
            events,
        }
    }
}
