//! Page rows backing the bundled page directory
//!
//! Pages are owned by the CMS; the store only needs existence, the active
//! flag and the view counter.

use diesel::prelude::*;

use super::diesel_schema::pages;
use super::models::{current_timestamp, NewPage, Page};
use crate::error::ReferralError;

/// Get page by ID
pub fn get_page(conn: &mut SqliteConnection, page_id: &str) -> Result<Option<Page>, ReferralError> {
    pages::table
        .filter(pages::id.eq(page_id))
        .select(Page::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ReferralError::Internal(format!("Query failed: {}", e)))
}

/// Register a page
pub fn create_page(
    conn: &mut SqliteConnection,
    page_id: &str,
    owner_identity_id: Option<&str>,
    title: &str,
) -> Result<Page, ReferralError> {
    if page_id.trim().is_empty() {
        return Err(ReferralError::InvalidInput("page id is required".into()));
    }

    let now = current_timestamp();
    diesel::insert_into(pages::table)
        .values(&NewPage {
            id: page_id,
            owner_identity_id,
            title,
            active: true,
            view_count: 0,
            created_at: &now,
        })
        .execute(conn)?;

    get_page(conn, page_id)?
        .ok_or_else(|| ReferralError::Internal("Failed to retrieve created page".into()))
}

/// Toggle whether a page accepts submissions
pub fn set_page_active(conn: &mut SqliteConnection, page_id: &str, active: bool) -> Result<bool, ReferralError> {
    let updated = diesel::update(pages::table.filter(pages::id.eq(page_id)))
        .set(pages::active.eq(active))
        .execute(conn)?;
    Ok(updated > 0)
}

/// Bump the page view counter
pub fn increment_view_count(conn: &mut SqliteConnection, page_id: &str) -> Result<(), ReferralError> {
    let updated = diesel::update(pages::table.filter(pages::id.eq(page_id)))
        .set(pages::view_count.eq(pages::view_count + 1))
        .execute(conn)?;

    if updated == 0 {
        return Err(ReferralError::PageUnavailable(page_id.to_string()));
    }
    Ok(())
}
