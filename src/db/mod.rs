//! SQLite database module for the referral hierarchy
//!
//! ## Architecture
//!
//! - Repository functions take `&mut SqliteConnection` and never commit on
//!   their own; the caller owns the transaction boundary.
//! - Mutating service operations run inside `ReferralDb::transaction`, a
//!   `BEGIN IMMEDIATE` transaction so concurrent writers serialise up front.
//!
//! ## Tables
//!
//! - `referral_nodes` - One node per (page, owner), addressed by handle
//! - `closure_edges` - Every ancestor/descendant pair with its depth
//! - `leads` - Attributed submissions, unique per (page, email)
//! - `identities`, `pages` - Collaborator tables for the bundled directories

pub mod closure;
pub mod context;
pub mod diesel_schema;
pub mod identities;
pub mod leads;
pub mod models;
pub mod nodes;
pub mod pages;
pub mod schema;

use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ReferralError;
use diesel_schema::{closure_edges, leads as leads_table, pages as pages_table, referral_nodes};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection PRAGMAs applied whenever the pool hands out a connection
#[derive(Debug, Clone)]
struct ConnectionOptions {
    busy_timeout_ms: u64,
    enable_wal: bool,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        let mut pragmas = format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        );
        // Enable WAL mode for better concurrent read performance
        if self.enable_wal {
            pragmas.push_str(" PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
        }
        conn.batch_execute(&pragmas)
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Pooled SQLite store for nodes, closure edges and leads
pub struct ReferralDb {
    pool: DbPool,
}

impl ReferralDb {
    /// Open or create the database described by `config`
    pub fn open(config: &Config) -> Result<Self, ReferralError> {
        std::fs::create_dir_all(&config.storage_dir)?;
        Self::open_path(&config.database_path(), config.pool_size, config.busy_timeout_ms)
    }

    /// Open or create a database file at `db_path`
    pub fn open_path(db_path: &Path, pool_size: u32, busy_timeout_ms: u64) -> Result<Self, ReferralError> {
        info!("Opening SQLite database at {:?}", db_path);

        let manager = ConnectionManager::<SqliteConnection>::new(db_path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout_ms,
                enable_wal: true,
            }))
            .build(manager)
            .map_err(|e| ReferralError::Connection(format!("Failed to build pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub fn open_in_memory() -> Result<Self, ReferralError> {
        debug!("Opening in-memory SQLite database");

        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout_ms: 1_000,
                enable_wal: false,
            }))
            .build(manager)
            .map_err(|e| ReferralError::Connection(format!("Failed to build in-memory pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), ReferralError> {
        let mut conn = self.conn()?;
        schema::init_schema(&mut conn)
    }

    /// Check a connection out of the pool
    pub fn conn(&self) -> Result<DbConn, ReferralError> {
        self.pool
            .get()
            .map_err(|e| ReferralError::Connection(format!("Failed to get connection: {}", e)))
    }

    /// Run a read-only closure against a pooled connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ReferralError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, ReferralError>,
    {
        let mut conn = self.conn()?;
        f(&mut conn)
    }

    /// Run `f` inside an immediate (write-locking) transaction
    ///
    /// Any error returned by `f` rolls back every write it made.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, ReferralError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, ReferralError>,
    {
        let mut conn = self.conn()?;
        conn.immediate_transaction(f)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, ReferralError> {
        self.with_conn(|conn| {
            let page_count: i64 = pages_table::table.count().get_result(conn)?;
            let node_count: i64 = referral_nodes::table.count().get_result(conn)?;
            let edge_count: i64 = closure_edges::table.count().get_result(conn)?;
            let lead_count: i64 = leads_table::table.count().get_result(conn)?;

            Ok(DbStats {
                page_count: page_count as u64,
                node_count: node_count as u64,
                edge_count: edge_count as u64,
                lead_count: lead_count as u64,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub page_count: u64,
    pub node_count: u64,
    pub edge_count: u64,
    pub lead_count: u64,
}

// Re-exports
pub use context::OperatorContext;
pub use models::{ClosureEdge, Identity, IdentitySummary, Lead, Node, Page, RelatedNode};
