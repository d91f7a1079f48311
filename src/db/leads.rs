//! Lead records - one attributed submission per (page, email)

use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::Deserialize;
use uuid::Uuid;

use super::diesel_schema::leads;
use super::identities::normalize_email;
use super::models::{current_timestamp, lead_status, Lead, NewLead};
use crate::error::ReferralError;

/// Query parameters for listing leads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadQuery {
    pub page_id: Option<String>,
    pub referrer_node_id: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 { 100 }

// ============================================================================
// Read Operations
// ============================================================================

/// Get lead by ID
pub fn get_lead(conn: &mut SqliteConnection, lead_id: &str) -> Result<Option<Lead>, ReferralError> {
    leads::table
        .filter(leads::id.eq(lead_id))
        .select(Lead::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Find the lead an email already submitted on a page
pub fn find_by_page_and_email(
    conn: &mut SqliteConnection,
    page_id: &str,
    email: &str,
) -> Result<Option<Lead>, ReferralError> {
    leads::table
        .filter(leads::page_id.eq(page_id))
        .filter(leads::submitter_email.eq(normalize_email(email)))
        .select(Lead::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Latest lead whose submitter node is `node_id`
pub fn latest_for_submitter_node(
    conn: &mut SqliteConnection,
    node_id: &str,
) -> Result<Option<Lead>, ReferralError> {
    leads::table
        .filter(leads::submitter_node_id.eq(node_id))
        .order(leads::created_at.desc())
        .select(Lead::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// List leads with filtering, newest first
pub fn list_leads(conn: &mut SqliteConnection, query: &LeadQuery) -> Result<Vec<Lead>, ReferralError> {
    let mut base_query = leads::table.into_boxed();

    if let Some(ref page_id) = query.page_id {
        base_query = base_query.filter(leads::page_id.eq(page_id));
    }
    if let Some(ref referrer) = query.referrer_node_id {
        base_query = base_query.filter(leads::referrer_node_id.eq(referrer));
    }
    if let Some(ref status) = query.status {
        base_query = base_query.filter(leads::status.eq(status));
    }

    base_query
        .order(leads::created_at.desc())
        .limit(query.limit)
        .offset(query.offset)
        .select(Lead::as_select())
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

// ============================================================================
// Write Operations
// ============================================================================

/// Insert a new lead with status `new`
///
/// A violation of UNIQUE(page_id, submitter_email) comes back as
/// `DuplicateLead`, carrying the id of the lead that got there first.
pub fn insert_lead(
    conn: &mut SqliteConnection,
    page_id: &str,
    referrer_node_id: &str,
    submitter_node_id: &str,
    submitter_identity_id: &str,
    submitter_email: &str,
) -> Result<Lead, ReferralError> {
    let id = Uuid::new_v4().to_string();
    let email = normalize_email(submitter_email);
    let now = current_timestamp();

    let inserted = diesel::insert_into(leads::table)
        .values(&NewLead {
            id: &id,
            page_id,
            referrer_node_id,
            submitter_node_id,
            submitter_identity_id,
            submitter_email: &email,
            status: lead_status::NEW,
            created_at: &now,
            updated_at: &now,
        })
        .execute(conn);

    match inserted {
        Ok(_) => {}
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            let existing = find_by_page_and_email(conn, page_id, &email)?
                .ok_or_else(|| ReferralError::Internal("Lead uniqueness violated but no lead found".into()))?;
            return Err(ReferralError::DuplicateLead {
                existing_lead_id: existing.id,
            });
        }
        Err(e) => return Err(e.into()),
    }

    get_lead(conn, &id)?
        .ok_or_else(|| ReferralError::Internal("Failed to retrieve created lead".into()))
}

/// Move a lead to `status`, enforcing the lead state machine
pub fn update_status(conn: &mut SqliteConnection, lead_id: &str, status: &str) -> Result<Lead, ReferralError> {
    let lead = get_lead(conn, lead_id)?
        .ok_or_else(|| ReferralError::LeadNotFound(lead_id.to_string()))?;

    if !lead_status::can_transition(&lead.status, status) {
        return Err(ReferralError::InvalidStatusTransition {
            from: lead.status,
            to: status.to_string(),
        });
    }

    diesel::update(leads::table.filter(leads::id.eq(lead_id)))
        .set((
            leads::status.eq(status),
            leads::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)?;

    get_lead(conn, lead_id)?
        .ok_or_else(|| ReferralError::LeadNotFound(lead_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nodes::{create_node, HandlePolicy};
    use crate::db::{identities, pages, schema::init_schema};
    use diesel::Connection;

    struct Fixture {
        conn: SqliteConnection,
        referrer: String,
        submitter: String,
        identity: String,
    }

    fn setup() -> Fixture {
        let mut conn = SqliteConnection::establish(":memory:").expect("Failed to create in-memory database");
        init_schema(&mut conn).expect("Failed to create schema");
        pages::create_page(&mut conn, "page-1", None, "Landing").unwrap();
        let (identity, _) =
            identities::create_with_temporary_credential(&mut conn, "bob@x.com", "Bob", None).unwrap();
        let policy = HandlePolicy::default();
        let referrer = create_node(&mut conn, &policy, "page-1", None, Some("alice")).unwrap();
        let submitter = create_node(&mut conn, &policy, "page-1", Some(&identity.id), None).unwrap();
        Fixture {
            conn,
            referrer: referrer.id,
            submitter: submitter.id,
            identity: identity.id,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let mut f = setup();
        let lead = insert_lead(&mut f.conn, "page-1", &f.referrer, &f.submitter, &f.identity, "Bob@X.com").unwrap();
        assert_eq!(lead.status, "new");
        assert_eq!(lead.submitter_email, "bob@x.com");

        let found = find_by_page_and_email(&mut f.conn, "page-1", "bob@x.com").unwrap().unwrap();
        assert_eq!(found.id, lead.id);
        assert_eq!(
            latest_for_submitter_node(&mut f.conn, &f.submitter).unwrap().unwrap().id,
            lead.id
        );
    }

    #[test]
    fn test_unique_violation_becomes_duplicate_lead() {
        let mut f = setup();
        let first = insert_lead(&mut f.conn, "page-1", &f.referrer, &f.submitter, &f.identity, "bob@x.com").unwrap();

        let err = insert_lead(&mut f.conn, "page-1", &f.referrer, &f.submitter, &f.identity, "BOB@x.com").unwrap_err();
        match err {
            ReferralError::DuplicateLead { existing_lead_id } => assert_eq!(existing_lead_id, first.id),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_transitions() {
        let mut f = setup();
        let lead = insert_lead(&mut f.conn, "page-1", &f.referrer, &f.submitter, &f.identity, "bob@x.com").unwrap();

        let err = update_status(&mut f.conn, &lead.id, "joined").unwrap_err();
        assert!(matches!(err, ReferralError::InvalidStatusTransition { .. }));

        let lead = update_status(&mut f.conn, &lead.id, "contacted").unwrap();
        assert_eq!(lead.status, "contacted");
        let lead = update_status(&mut f.conn, &lead.id, "joined").unwrap();
        assert_eq!(lead.status, "joined");

        assert!(matches!(
            update_status(&mut f.conn, "missing", "contacted"),
            Err(ReferralError::LeadNotFound(_))
        ));
    }

    #[test]
    fn test_list_leads_filters() {
        let mut f = setup();
        insert_lead(&mut f.conn, "page-1", &f.referrer, &f.submitter, &f.identity, "bob@x.com").unwrap();

        let by_referrer = list_leads(&mut f.conn, &LeadQuery {
            referrer_node_id: Some(f.referrer.clone()),
            limit: 10,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(by_referrer.len(), 1);

        let contacted = list_leads(&mut f.conn, &LeadQuery {
            status: Some("contacted".into()),
            limit: 10,
            ..Default::default()
        })
        .unwrap();
        assert!(contacted.is_empty());
    }
}
