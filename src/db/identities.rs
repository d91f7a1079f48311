//! Identity rows backing the bundled identity directory
//!
//! Applicants who do not have an account yet get one with a random temporary
//! credential; only its SHA-256 digest is stored.

use std::collections::HashMap;

use diesel::prelude::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::diesel_schema::identities;
use super::models::{current_timestamp, Identity, IdentitySummary, NewIdentity};
use crate::error::ReferralError;

const TEMPORARY_CREDENTIAL_LEN: usize = 16;

/// Canonical form used for lookups and uniqueness
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Minimal shape check; delivery is the messaging side's concern
pub fn validate_email(email: &str) -> Result<(), ReferralError> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    };
    if !valid {
        return Err(ReferralError::InvalidInput(format!("'{}' is not a valid email", email)));
    }
    Ok(())
}

/// Get identity by ID
pub fn get_identity(conn: &mut SqliteConnection, id: &str) -> Result<Option<Identity>, ReferralError> {
    identities::table
        .filter(identities::id.eq(id))
        .select(Identity::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Find identity by (normalised) email
pub fn find_by_email(conn: &mut SqliteConnection, email: &str) -> Result<Option<Identity>, ReferralError> {
    identities::table
        .filter(identities::email.eq(normalize_email(email)))
        .select(Identity::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Create an identity holding a fresh temporary credential
///
/// Returns the identity and the plaintext credential, which is not stored.
pub fn create_with_temporary_credential(
    conn: &mut SqliteConnection,
    email: &str,
    display_name: &str,
    phone: Option<&str>,
) -> Result<(Identity, String), ReferralError> {
    validate_email(email)?;

    let id = Uuid::new_v4().to_string();
    let email = normalize_email(email);
    let credential = generate_temporary_credential();
    let credential_hash = hash_credential(&credential);
    let now = current_timestamp();

    diesel::insert_into(identities::table)
        .values(&NewIdentity {
            id: &id,
            email: &email,
            display_name: display_name.trim(),
            phone,
            credential_hash: &credential_hash,
            must_reset_credential: true,
            created_at: &now,
        })
        .execute(conn)?;

    let identity = get_identity(conn, &id)?
        .ok_or_else(|| ReferralError::Internal("Failed to retrieve created identity".into()))?;
    Ok((identity, credential))
}

/// Display data for a set of identities, keyed by id
pub fn summaries_for(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> Result<HashMap<String, IdentitySummary>, ReferralError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<IdentitySummary> = identities::table
        .filter(identities::id.eq_any(ids))
        .select(IdentitySummary::as_select())
        .load(conn)
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))?;

    Ok(rows.into_iter().map(|row| (row.id.clone(), row)).collect())
}

fn generate_temporary_credential() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEMPORARY_CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}

/// Hex SHA-256 digest of a credential
pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}
