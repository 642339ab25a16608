//! `PostgreSQL` reservation ledger.

use crate::is_unreachable;
use chrono::{DateTime, Utc};
use reservation_core::ledger::{InsertOutcome, LedgerError, Page, PersistentLedger, StatusChange};
use reservation_core::{
    OrderId, PolicyId, RequestId, RequesterId, ReservationId, ReservationRecord,
    ReservationStatus,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

const COLUMNS: &str = "id, policy_id, request_id, requester_id, resource_code, quantity, \
                       status, order_id, used_at, created_at";

/// `PostgreSQL` ledger over the `reservations` table.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a ledger on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_id(&self, id: ReservationId) -> Result<Option<ReservationRecord>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM reservations WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ledger_error(&e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn fetch_by_request(
        &self,
        policy_id: PolicyId,
        request_id: &RequestId,
    ) -> Result<Option<ReservationRecord>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM reservations WHERE policy_id = $1 AND request_id = $2"
        ))
        .bind(policy_id.get())
        .bind(request_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ledger_error(&e))?;
        row.as_ref().map(record_from_row).transpose()
    }
}

fn ledger_error(error: &sqlx::Error) -> LedgerError {
    if is_unreachable(error) {
        LedgerError::ConnectionFailed(error.to_string())
    } else {
        LedgerError::DatabaseError(error.to_string())
    }
}

fn decode_error(error: impl std::fmt::Display) -> LedgerError {
    LedgerError::Serialization(error.to_string())
}

fn record_from_row(row: &PgRow) -> Result<ReservationRecord, LedgerError> {
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let policy_id: i64 = row.try_get("policy_id").map_err(decode_error)?;
    let request_id: String = row.try_get("request_id").map_err(decode_error)?;
    let requester_id: i64 = row.try_get("requester_id").map_err(decode_error)?;
    let quantity: i32 = row.try_get("quantity").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let order_id: Option<i64> = row.try_get("order_id").map_err(decode_error)?;
    let used_at: Option<DateTime<Utc>> = row.try_get("used_at").map_err(decode_error)?;

    Ok(ReservationRecord {
        id: ReservationId::from_uuid(id),
        policy_id: PolicyId::new(policy_id),
        request_id: RequestId::parse(request_id).map_err(decode_error)?,
        requester_id: RequesterId::new(requester_id),
        resource_code: row.try_get("resource_code").map_err(decode_error)?,
        quantity: u32::try_from(quantity).map_err(decode_error)?,
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| LedgerError::Serialization(format!("Unknown status: {status}")))?,
        order_id: order_id.map(OrderId::new),
        used_at,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

impl PersistentLedger for PostgresLedger {
    fn insert_if_absent(
        &self,
        record: &ReservationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<InsertOutcome, LedgerError>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            let quantity = i32::try_from(record.quantity).map_err(decode_error)?;
            let inserted = sqlx::query(&format!(
                r"
                INSERT INTO reservations ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (policy_id, request_id) DO NOTHING
                RETURNING {COLUMNS}
                "
            ))
            .bind(record.id.as_uuid())
            .bind(record.policy_id.get())
            .bind(record.request_id.as_str())
            .bind(record.requester_id.get())
            .bind(&record.resource_code)
            .bind(quantity)
            .bind(record.status.as_str())
            .bind(record.order_id.map(|o| o.get()))
            .bind(record.used_at)
            .bind(record.created_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ledger_error(&e))?;

            if let Some(row) = inserted {
                return Ok(InsertOutcome::Inserted(record_from_row(&row)?));
            }

            // The conflicting row exists; rows are never deleted, so it is still there
            let existing = self
                .fetch_by_request(record.policy_id, &record.request_id)
                .await?
                .ok_or_else(|| {
                    LedgerError::DatabaseError(format!(
                        "Conflict on ({}, {}) but no row found",
                        record.policy_id, record.request_id
                    ))
                })?;

            tracing::debug!(
                policy_id = %record.policy_id,
                request_id = %record.request_id,
                reservation_id = %existing.id,
                "Reservation already recorded"
            );
            metrics::counter!("reservation_ledger_duplicates_total").increment(1);
            Ok(InsertOutcome::AlreadyExists(existing))
        })
    }

    fn find_by_id(
        &self,
        id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(self.fetch_by_id(id))
    }

    fn find_by_request(
        &self,
        policy_id: PolicyId,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        let request_id = request_id.clone();
        Box::pin(async move { self.fetch_by_request(policy_id, &request_id).await })
    }

    fn update_status(
        &self,
        id: ReservationId,
        change: StatusChange,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let updated = sqlx::query(&format!(
                r"
                UPDATE reservations
                SET status = $3, order_id = $4, used_at = $5
                WHERE id = $1 AND status = $2
                RETURNING {COLUMNS}
                "
            ))
            .bind(id.as_uuid())
            .bind(change.expected.as_str())
            .bind(change.next.as_str())
            .bind(change.order_id.map(|o| o.get()))
            .bind(change.used_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ledger_error(&e))?;

            if let Some(row) = updated {
                return record_from_row(&row);
            }

            // Compare-and-set lost: report what is actually there
            match self.fetch_by_id(id).await? {
                None => Err(LedgerError::NotFound(id)),
                Some(current) => Err(LedgerError::StatusConflict {
                    id,
                    expected: change.expected,
                    actual: current.status,
                }),
            }
        })
    }

    fn active_units(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let total: i64 = sqlx::query_scalar(
                r"
                SELECT COALESCE(SUM(quantity), 0)::BIGINT
                FROM reservations
                WHERE policy_id = $1 AND status <> 'REJECTED'
                ",
            )
            .bind(policy_id.get())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ledger_error(&e))?;
            u64::try_from(total).map_err(decode_error)
        })
    }

    fn list_by_requester(
        &self,
        requester_id: RequesterId,
        status: Option<ReservationStatus>,
        page: Page,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(async move {
            let offset = i64::try_from(page.offset()).map_err(decode_error)?;
            let rows = sqlx::query(&format!(
                r"
                SELECT {COLUMNS}
                FROM reservations
                WHERE requester_id = $1 AND ($2::TEXT IS NULL OR status = $2)
                ORDER BY created_at DESC, id
                LIMIT $3 OFFSET $4
                "
            ))
            .bind(requester_id.get())
            .bind(status.map(|s| s.as_str()))
            .bind(i64::from(page.size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ledger_error(&e))?;

            rows.iter().map(record_from_row).collect()
        })
    }
}
