//! Row mapping trait and helpers for reducing boilerplate in queries.
//!
//! This module provides a `FromRow` trait that models can implement to
//! define how they are constructed from database rows, plus helper functions
//! for common query patterns.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to rusqlite errors.
///
/// This provides graceful error handling instead of panicking when database
/// contains invalid enum values.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Nullable variant of [`parse_enum`].
fn parse_enum_opt<T: std::str::FromStr>(
    row: &Row,
    col: usize,
    col_name: &str,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(col)? {
        Some(s) => s.parse::<T>().map(Some).map_err(|_| {
            rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
        }),
        None => Ok(None),
    }
}

/// Trait for constructing a type from a database row.
///
/// Implementing this trait allows using the `query_one` and `query_all`
/// helper functions, reducing repetitive row mapping closures.
pub trait FromRow: Sized {
    /// Construct an instance from a database row.
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const COURSE_COLS: &str = "id, title, price_cents, currency, hotmart_url, kiwify_url";

pub const PAYMENT_ORDER_COLS: &str = "id, user_id, course_id, gateway, external_reference, amount_cents, currency, status, version, enrollment_pending, created_at, updated_at, raw_last_event, checkout_url, client_secret";

pub const ENROLLMENT_COLS: &str = "id, user_id, course_id, order_id, enrolled_at, progress";

pub const WEBHOOK_EVENT_COLS: &str = "id, gateway, external_reference, declared_status, dedup_key, received_at, signature_valid, processed, outcome, payload";

pub const EXTERNAL_CHECKOUT_COLS: &str = "user_id, course_id, tax_id, captured_at";

// ============ FromRow Implementations ============

impl FromRow for Course {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Course {
            id: row.get(0)?,
            title: row.get(1)?,
            price_cents: row.get(2)?,
            currency: row.get(3)?,
            hotmart_url: row.get(4)?,
            kiwify_url: row.get(5)?,
        })
    }
}

impl FromRow for PaymentOrder {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PaymentOrder {
            id: row.get(0)?,
            user_id: row.get(1)?,
            course_id: row.get(2)?,
            gateway: parse_enum(row, 3, "gateway")?,
            external_reference: row.get(4)?,
            amount_cents: row.get(5)?,
            currency: row.get(6)?,
            status: parse_enum(row, 7, "status")?,
            version: row.get(8)?,
            enrollment_pending: row.get::<_, i32>(9)? != 0,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            raw_last_event: row.get(12)?,
            checkout_url: row.get(13)?,
            client_secret: row.get(14)?,
        })
    }
}

impl FromRow for Enrollment {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Enrollment {
            id: row.get(0)?,
            user_id: row.get(1)?,
            course_id: row.get(2)?,
            order_id: row.get(3)?,
            enrolled_at: row.get(4)?,
            progress: row.get(5)?,
        })
    }
}

impl FromRow for WebhookEvent {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(WebhookEvent {
            id: row.get(0)?,
            gateway: parse_enum(row, 1, "gateway")?,
            external_reference: row.get(2)?,
            declared_status: parse_enum_opt(row, 3, "declared_status")?,
            dedup_key: row.get(4)?,
            received_at: row.get(5)?,
            signature_valid: row.get::<_, i32>(6)? != 0,
            processed: row.get::<_, i32>(7)? != 0,
            outcome: parse_enum_opt(row, 8, "outcome")?,
            payload: row.get(9)?,
        })
    }
}

impl FromRow for ExternalCheckoutRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ExternalCheckoutRecord {
            user_id: row.get(0)?,
            course_id: row.get(1)?,
            tax_id: row.get(2)?,
            captured_at: row.get(3)?,
        })
    }
}

impl FromRow for PendingExternalOrder {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PendingExternalOrder {
            order_id: row.get(0)?,
            user_id: row.get(1)?,
            course_id: row.get(2)?,
            gateway: parse_enum(row, 3, "gateway")?,
            amount_cents: row.get(4)?,
            currency: row.get(5)?,
            created_at: row.get(6)?,
            tax_id: row.get(7)?,
        })
    }
}
