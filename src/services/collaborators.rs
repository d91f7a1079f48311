//! Seams to the systems the referral core consumes but does not own
//!
//! Identity and page lookups take the caller's connection so that anything
//! they write (a new identity, a view count) commits or rolls back with the
//! lead submission that caused it.

use std::collections::HashMap;

use diesel::SqliteConnection;
use serde::Deserialize;
use tracing::debug;

use crate::db::models::{Identity, IdentitySummary, Page};
use crate::db::{identities, pages};
use crate::error::ReferralError;

/// The person submitting a capture form
#[derive(Debug, Clone, Deserialize)]
pub struct Applicant {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Applicant {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            phone: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn validate(&self) -> Result<(), ReferralError> {
        if self.name.trim().is_empty() {
            return Err(ReferralError::InvalidInput("applicant name is required".into()));
        }
        identities::validate_email(&self.email)
    }
}

/// An identity found or created for an applicant
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    /// True when the identity was created by this call
    pub created: bool,
}

/// Identity lookup and on-demand creation
pub trait IdentityDirectory: Send + Sync {
    /// Find the identity for an applicant's email, creating one with a
    /// temporary credential if none exists
    fn find_or_create(
        &self,
        conn: &mut SqliteConnection,
        applicant: &Applicant,
    ) -> Result<ResolvedIdentity, ReferralError>;

    /// Display data for identities, keyed by id
    fn summaries(
        &self,
        conn: &mut SqliteConnection,
        ids: &[String],
    ) -> Result<HashMap<String, IdentitySummary>, ReferralError>;
}

/// Page existence checks and the page view counter
pub trait PageDirectory: Send + Sync {
    /// The page, if it exists and accepts submissions
    fn require_active(&self, conn: &mut SqliteConnection, page_id: &str) -> Result<Page, ReferralError>;

    /// Count one view on the page
    fn record_view(&self, conn: &mut SqliteConnection, page_id: &str) -> Result<(), ReferralError>;
}

/// Identity directory backed by the `identities` table
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlIdentityDirectory;

impl IdentityDirectory for SqlIdentityDirectory {
    fn find_or_create(
        &self,
        conn: &mut SqliteConnection,
        applicant: &Applicant,
    ) -> Result<ResolvedIdentity, ReferralError> {
        if let Some(identity) = identities::find_by_email(conn, &applicant.email)? {
            return Ok(ResolvedIdentity {
                identity,
                created: false,
            });
        }

        // The plaintext credential is not kept; the holder resets it on first login.
        let (identity, _credential) = identities::create_with_temporary_credential(
            conn,
            &applicant.email,
            &applicant.name,
            applicant.phone.as_deref(),
        )?;
        debug!(identity_id = %identity.id, "Identity created for applicant");

        Ok(ResolvedIdentity {
            identity,
            created: true,
        })
    }

    fn summaries(
        &self,
        conn: &mut SqliteConnection,
        ids: &[String],
    ) -> Result<HashMap<String, IdentitySummary>, ReferralError> {
        identities::summaries_for(conn, ids)
    }
}

/// Page directory backed by the `pages` table
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlPageDirectory;

impl PageDirectory for SqlPageDirectory {
    fn require_active(&self, conn: &mut SqliteConnection, page_id: &str) -> Result<Page, ReferralError> {
        match pages::get_page(conn, page_id)? {
            Some(page) if page.active => Ok(page),
            _ => Err(ReferralError::PageUnavailable(page_id.to_string())),
        }
    }

    fn record_view(&self, conn: &mut SqliteConnection, page_id: &str) -> Result<(), ReferralError> {
        pages::increment_view_count(conn, page_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use diesel::Connection;

    fn setup_test_db() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:").expect("Failed to create in-memory database");
        init_schema(&mut conn).expect("Failed to create schema");
        conn
    }

    #[test]
    fn test_find_or_create_reuses_identity() {
        let mut conn = setup_test_db();
        let directory = SqlIdentityDirectory;
        let applicant = Applicant::new("Bob", "bob@x.com").with_phone("+1555");

        let first = directory.find_or_create(&mut conn, &applicant).unwrap();
        assert!(first.created);
        let second = directory
            .find_or_create(&mut conn, &Applicant::new("Robert", "BOB@x.com"))
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.identity.id, second.identity.id);
        assert_eq!(second.identity.display_name, "Bob");
    }

    #[test]
    fn test_require_active_page() {
        let mut conn = setup_test_db();
        let directory = SqlPageDirectory;
        pages::create_page(&mut conn, "page-1", None, "Landing").unwrap();

        assert_eq!(directory.require_active(&mut conn, "page-1").unwrap().title, "Landing");
        directory.record_view(&mut conn, "page-1").unwrap();
        assert_eq!(pages::get_page(&mut conn, "page-1").unwrap().unwrap().view_count, 1);

        pages::set_page_active(&mut conn, "page-1", false).unwrap();
        assert!(matches!(
            directory.require_active(&mut conn, "page-1"),
            Err(ReferralError::PageUnavailable(_))
        ));
        assert!(matches!(
            directory.require_active(&mut conn, "missing"),
            Err(ReferralError::PageUnavailable(_))
        ));
    }

    #[test]
    fn test_applicant_validation() {
        assert!(Applicant::new("Bob", "bob@x.com").validate().is_ok());
        assert!(Applicant::new(" ", "bob@x.com").validate().is_err());
        assert!(Applicant::new("Bob", "bob").validate().is_err());
    }
}
