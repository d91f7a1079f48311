//! Database schema definitions

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use tracing::info;

use crate::error::ReferralError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), ReferralError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, ReferralError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .map_err(|e| ReferralError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let row = diesel::sql_query("SELECT version FROM schema_version LIMIT 1")
        .get_result::<VersionRow>(conn)
        .optional()?;

    Ok(row.map(|r| r.version).unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), ReferralError> {
    diesel::sql_query("DELETE FROM schema_version").execute(conn)?;
    diesel::sql_query("INSERT INTO schema_version (version) VALUES (?)")
        .bind::<Integer, _>(version)
        .execute(conn)?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &mut SqliteConnection) -> Result<(), ReferralError> {
    conn.batch_execute(COLLABORATOR_SCHEMA)
        .map_err(|e| ReferralError::Internal(format!("Failed to create collaborator tables: {}", e)))?;

    conn.batch_execute(HIERARCHY_SCHEMA)
        .map_err(|e| ReferralError::Internal(format!("Failed to create hierarchy tables: {}", e)))?;

    conn.batch_execute(LEADS_SCHEMA)
        .map_err(|e| ReferralError::Internal(format!("Failed to create lead tables: {}", e)))?;

    Ok(())
}

/// Run migrations from an older version
fn migrate_schema(conn: &mut SqliteConnection, from_version: i32) -> Result<(), ReferralError> {
    // Only v1 exists so far; anything older is an unversioned database.
    if from_version < 1 {
        create_tables(conn)?;
    }
    set_schema_version(conn, SCHEMA_VERSION)
}

/// Pages and identities. Owned by external systems in production; the
/// bundled directories keep them in the same database so they share the
/// ingestion transaction.
const COLLABORATOR_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY NOT NULL,
    email TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    phone TEXT,
    credential_hash TEXT NOT NULL,
    must_reset_credential BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pages (
    id TEXT PRIMARY KEY NOT NULL,
    owner_identity_id TEXT REFERENCES identities(id),
    title TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT 1,
    view_count BIGINT NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

const HIERARCHY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS referral_nodes (
    id TEXT PRIMARY KEY NOT NULL,
    page_id TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    owner_identity_id TEXT REFERENCES identities(id),
    handle TEXT NOT NULL,
    click_count BIGINT NOT NULL DEFAULT 0 CHECK (click_count >= 0),
    lead_count BIGINT NOT NULL DEFAULT 0 CHECK (lead_count >= 0),
    active BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    UNIQUE (page_id, handle),
    UNIQUE (page_id, owner_identity_id)
);

CREATE TABLE IF NOT EXISTS closure_edges (
    ancestor_id TEXT NOT NULL REFERENCES referral_nodes(id) ON DELETE CASCADE,
    descendant_id TEXT NOT NULL REFERENCES referral_nodes(id) ON DELETE CASCADE,
    depth INTEGER NOT NULL CHECK (depth >= 0),
    PRIMARY KEY (ancestor_id, descendant_id)
);

CREATE INDEX IF NOT EXISTS idx_closure_descendant ON closure_edges(descendant_id);
CREATE INDEX IF NOT EXISTS idx_closure_ancestor_depth ON closure_edges(ancestor_id, depth);
"#;

const LEADS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS leads (
    id TEXT PRIMARY KEY NOT NULL,
    page_id TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    referrer_node_id TEXT NOT NULL REFERENCES referral_nodes(id) ON DELETE CASCADE,
    submitter_node_id TEXT NOT NULL REFERENCES referral_nodes(id) ON DELETE CASCADE,
    submitter_identity_id TEXT NOT NULL REFERENCES identities(id),
    submitter_email TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (page_id, submitter_email)
);

CREATE INDEX IF NOT EXISTS idx_leads_referrer ON leads(referrer_node_id);
CREATE INDEX IF NOT EXISTS idx_leads_submitter ON leads(submitter_node_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::Connection;

    #[test]
    fn test_init_schema_is_idempotent() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        init_schema(&mut conn).unwrap();
        assert_eq!(get_schema_version(&mut conn).unwrap(), SCHEMA_VERSION);
    }
}
