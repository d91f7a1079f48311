//! Attribution service - lead ingestion and click tracking
//!
//! `submit_lead` runs the whole ingestion in one immediate transaction:
//!
//! 1. Idempotency check on (page, email)
//! 2. Resolve or materialise the referrer node for the handle
//! 3. Find or create the applicant identity
//! 4. Find the applicant's node, or create it under the referrer
//! 5. Insert the lead (status `new`)
//! 6. Credit the referrer and count the page view
//!
//! Any failure rolls all of it back, including a freshly created identity.
//! The `LeadCreated` event goes out only after commit.

use std::sync::Arc;

use diesel::SqliteConnection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::models::{lead_status, Lead, Node};
use crate::db::nodes::HandlePolicy;
use crate::db::{closure, identities, leads, nodes, OperatorContext, ReferralDb};
use crate::error::ReferralError;

use super::collaborators::{Applicant, IdentityDirectory, PageDirectory};
use super::events::{EventBus, ReferralEvent};

/// Handle value that means "no referrer"
const DIRECT_MARKER: &str = "direct";

/// Outcome of a lead submission
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LeadResult {
    Created(Box<LeadReceipt>),
    /// The email already has a lead on this page; nothing was written
    Conflict { existing_lead_id: String },
}

impl LeadResult {
    pub fn lead_id(&self) -> &str {
        match self {
            LeadResult::Created(receipt) => &receipt.lead.id,
            LeadResult::Conflict { existing_lead_id } => existing_lead_id,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LeadResult::Conflict { .. })
    }
}

/// Everything a successful submission wrote
#[derive(Debug, Clone, Serialize)]
pub struct LeadReceipt {
    pub lead: Lead,
    /// Referrer node after its lead count was bumped
    pub referrer: Node,
    /// Node owned by the applicant
    pub submitter: Node,
    pub identity_created: bool,
    /// False when the applicant already had a node and kept its upline
    pub submitter_attached: bool,
    pub referrer_link: String,
    pub submitter_link: String,
}

enum Ingestion {
    Duplicate(String),
    Created(Box<LeadReceipt>),
}

/// Attribution service for lead submissions and link clicks
pub struct AttributionService {
    db: Arc<ReferralDb>,
    events: Arc<EventBus>,
    identities: Arc<dyn IdentityDirectory>,
    pages: Arc<dyn PageDirectory>,
    config: Arc<Config>,
    policy: HandlePolicy,
}

impl AttributionService {
    /// Create a new attribution service
    pub fn new(
        db: Arc<ReferralDb>,
        events: Arc<EventBus>,
        identities: Arc<dyn IdentityDirectory>,
        pages: Arc<dyn PageDirectory>,
        config: Arc<Config>,
    ) -> Self {
        let policy = HandlePolicy::from(config.as_ref());
        Self {
            db,
            events,
            identities,
            pages,
            config,
            policy,
        }
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Attribute a capture-form submission to the referrer behind `referrer_handle`
    ///
    /// Submitting twice for the same (page, email) returns
    /// `LeadResult::Conflict` pointing at the first lead, also when two
    /// submissions race.
    pub fn submit_lead(
        &self,
        page_id: &str,
        referrer_handle: Option<&str>,
        applicant: &Applicant,
    ) -> Result<LeadResult, ReferralError> {
        applicant.validate()?;
        let email = identities::normalize_email(&applicant.email);

        let outcome = self.db.transaction(|conn| {
            if let Some(existing) = leads::find_by_page_and_email(conn, page_id, &email)? {
                return Ok(Ingestion::Duplicate(existing.id));
            }

            self.pages.require_active(conn, page_id)?;

            let referrer = self.resolve_referrer(conn, page_id, referrer_handle)?;
            let resolved = self.identities.find_or_create(conn, applicant)?;

            let (submitter, submitter_attached) =
                match nodes::find_by_owner(conn, page_id, &resolved.identity.id)? {
                    Some(existing) => {
                        if existing.id != referrer.id {
                            debug!(
                                node_id = %existing.id,
                                referrer = %referrer.handle,
                                "Applicant already has a node; keeping its upline"
                            );
                        }
                        (existing, false)
                    }
                    None => {
                        let node = nodes::create_node(
                            conn,
                            &self.policy,
                            page_id,
                            Some(&resolved.identity.id),
                            None,
                        )?;
                        closure::attach(conn, &node.id, &referrer.id)?;
                        (node, true)
                    }
                };

            let lead = leads::insert_lead(
                conn,
                page_id,
                &referrer.id,
                &submitter.id,
                &resolved.identity.id,
                &email,
            )?;

            nodes::increment_lead_count(conn, &referrer.id)?;
            self.pages.record_view(conn, page_id)?;
            let referrer = nodes::require_node(conn, &referrer.id)?;

            Ok(Ingestion::Created(Box::new(LeadReceipt {
                referrer_link: self.config.referral_link(page_id, &referrer.handle),
                submitter_link: self.config.referral_link(page_id, &submitter.handle),
                lead,
                referrer,
                submitter,
                identity_created: resolved.created,
                submitter_attached,
            })))
        });

        match outcome {
            Ok(Ingestion::Created(receipt)) => {
                info!(
                    page_id,
                    lead_id = %receipt.lead.id,
                    referrer = %receipt.referrer.handle,
                    "Lead attributed"
                );
                self.events.emit(ReferralEvent::LeadCreated {
                    page_id: page_id.to_string(),
                    lead_id: receipt.lead.id.clone(),
                    applicant_name: applicant.name.trim().to_string(),
                    applicant_email: email,
                    applicant_phone: applicant.phone.clone(),
                    identity_created: receipt.identity_created,
                    referrer_node_id: receipt.referrer.id.clone(),
                    referrer_handle: receipt.referrer.handle.clone(),
                    referrer_link: receipt.referrer_link.clone(),
                    submitter_link: receipt.submitter_link.clone(),
                });
                Ok(LeadResult::Created(receipt))
            }
            Ok(Ingestion::Duplicate(existing_lead_id))
            | Err(ReferralError::DuplicateLead { existing_lead_id }) => {
                debug!(page_id, lead_id = %existing_lead_id, "Duplicate lead submission");
                Ok(LeadResult::Conflict { existing_lead_id })
            }
            Err(e) => {
                warn!(page_id, error = %e, "Lead submission failed");
                Err(e)
            }
        }
    }

    /// Count a click on a shared link, materialising unknown handles
    pub fn record_click(&self, page_id: &str, handle: Option<&str>) -> Result<Node, ReferralError> {
        let node = self.db.transaction(|conn| {
            self.pages.require_active(conn, page_id)?;
            let handle = self.canonical_handle(handle);
            let node = self.materialize(conn, page_id, &handle)?;
            nodes::increment_click_count(conn, &node.id)?;
            nodes::require_node(conn, &node.id)
        })?;

        self.events.emit(ReferralEvent::LinkClicked {
            page_id: page_id.to_string(),
            node_id: node.id.clone(),
            handle: node.handle.clone(),
        });
        Ok(node)
    }

    /// Move a lead along its status machine
    pub fn update_lead_status(
        &self,
        operator: &OperatorContext,
        lead_id: &str,
        status: &str,
    ) -> Result<Lead, ReferralError> {
        if !lead_status::is_valid(status) {
            return Err(ReferralError::InvalidInput(format!(
                "status '{}' is not valid. Valid statuses: {:?}",
                status,
                lead_status::ALL
            )));
        }

        let (previous, lead) = self.db.transaction(|conn| {
            let previous = leads::get_lead(conn, lead_id)?
                .ok_or_else(|| ReferralError::LeadNotFound(lead_id.to_string()))?;
            let lead = leads::update_status(conn, lead_id, status)?;
            Ok((previous.status, lead))
        })?;

        info!(lead_id, from = %previous, to = %lead.status, actor = %operator.actor_id, "Lead status updated");
        self.events.emit(ReferralEvent::LeadStatusChanged {
            lead_id: lead.id.clone(),
            from: previous,
            to: lead.status.clone(),
            actor_id: operator.actor_id.clone(),
        });
        Ok(lead)
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Get lead by ID
    pub fn get_lead(&self, lead_id: &str) -> Result<Option<Lead>, ReferralError> {
        self.db.with_conn(|conn| leads::get_lead(conn, lead_id))
    }

    /// Find the lead an email submitted on a page
    pub fn find_lead(&self, page_id: &str, email: &str) -> Result<Option<Lead>, ReferralError> {
        self.db.with_conn(|conn| leads::find_by_page_and_email(conn, page_id, email))
    }

    /// List leads with filtering, newest first
    pub fn list_leads(&self, query: &leads::LeadQuery) -> Result<Vec<Lead>, ReferralError> {
        self.db.with_conn(|conn| leads::list_leads(conn, query))
    }

    /// Find a node by its handle on a page
    pub fn find_node(&self, page_id: &str, handle: &str) -> Result<Option<Node>, ReferralError> {
        let handle = nodes::validate_handle(handle)?;
        self.db.with_conn(|conn| nodes::find_by_handle(conn, page_id, &handle))
    }

    // =========================================================================
    // Handle Resolution
    // =========================================================================

    /// Map missing, "direct" and malformed handles to the page's entry handle
    fn canonical_handle(&self, handle: Option<&str>) -> String {
        let direct = self.config.direct_handle.to_lowercase();
        match handle.map(str::trim) {
            None | Some("") => direct,
            Some(h) if h.eq_ignore_ascii_case(DIRECT_MARKER) => direct,
            Some(h) => match nodes::validate_handle(h) {
                Ok(valid) => valid,
                Err(e) => {
                    warn!(handle = h, error = %e, "Unusable referral handle, crediting page entry");
                    direct
                }
            },
        }
    }

    /// The node for `handle`, created without upline if nobody has it yet
    fn materialize(&self, conn: &mut SqliteConnection, page_id: &str, handle: &str) -> Result<Node, ReferralError> {
        if let Some(node) = nodes::find_by_handle(conn, page_id, handle)? {
            return Ok(node);
        }
        debug!(page_id, handle, "Materialising node for unknown handle");
        nodes::create_node(conn, &self.policy, page_id, None, Some(handle))
    }

    /// Active referrer node for a submission
    ///
    /// Inactive referrers are not credited; the page entry node takes the lead.
    /// The entry node is the last resort, so it is credited even when
    /// deactivated.
    fn resolve_referrer(
        &self,
        conn: &mut SqliteConnection,
        page_id: &str,
        handle: Option<&str>,
    ) -> Result<Node, ReferralError> {
        let handle = self.canonical_handle(handle);
        let node = self.materialize(conn, page_id, &handle)?;
        if node.active {
            return Ok(node);
        }

        let direct = self.canonical_handle(None);
        if handle == direct {
            debug!(page_id, handle = %handle, "Page entry node inactive, crediting it anyway");
            return Ok(node);
        }
        warn!(page_id, handle = %handle, "Referrer node inactive, crediting page entry");
        self.materialize(conn, page_id, &direct)
    }
}
