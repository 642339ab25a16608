//! `PostgreSQL` policy store.

use crate::is_unreachable;
use reservation_core::policy::{PolicyStore, PolicyStoreError};
use reservation_core::{PolicyId, ResourcePolicy};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Policy store over the `resource_policies` table.
#[derive(Clone)]
pub struct PostgresPolicyStore {
    pool: PgPool,
}

impl PostgresPolicyStore {
    /// Create a policy store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace a policy.
    ///
    /// Policies are administered outside the engine; this exists for seeding and tests.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyStoreError`] if the write fails or the quantity does not fit.
    pub async fn upsert(&self, policy: &ResourcePolicy) -> Result<(), PolicyStoreError> {
        let total = i32::try_from(policy.total_quantity).map_err(|e| PolicyStoreError::Invalid {
            policy_id: policy.id,
            reason: e.to_string(),
        })?;

        sqlx::query(
            r"
            INSERT INTO resource_policies (id, name, total_quantity, valid_from, valid_until)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                total_quantity = EXCLUDED.total_quantity,
                valid_from = EXCLUDED.valid_from,
                valid_until = EXCLUDED.valid_until
            ",
        )
        .bind(policy.id.get())
        .bind(&policy.name)
        .bind(total)
        .bind(policy.valid_from)
        .bind(policy.valid_until)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error(&e))?;

        tracing::info!(policy_id = %policy.id, total_quantity = policy.total_quantity, "Policy stored");
        Ok(())
    }
}

fn store_error(error: &sqlx::Error) -> PolicyStoreError {
    if is_unreachable(error) {
        PolicyStoreError::ConnectionFailed(error.to_string())
    } else {
        PolicyStoreError::Backend(error.to_string())
    }
}

fn policy_from_row(policy_id: PolicyId, row: &PgRow) -> Result<ResourcePolicy, PolicyStoreError> {
    let invalid = |reason: String| PolicyStoreError::Invalid { policy_id, reason };

    let total: i32 = row.try_get("total_quantity").map_err(|e| invalid(e.to_string()))?;
    let policy = ResourcePolicy {
        id: policy_id,
        name: row.try_get("name").map_err(|e| invalid(e.to_string()))?,
        total_quantity: u32::try_from(total).map_err(|e| invalid(e.to_string()))?,
        valid_from: row.try_get("valid_from").map_err(|e| invalid(e.to_string()))?,
        valid_until: row.try_get("valid_until").map_err(|e| invalid(e.to_string()))?,
    };

    if policy.valid_until < policy.valid_from {
        return Err(invalid("window ends before it starts".to_string()));
    }
    Ok(policy)
}

impl PolicyStore for PostgresPolicyStore {
    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResourcePolicy>, PolicyStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT name, total_quantity, valid_from, valid_until
                FROM resource_policies
                WHERE id = $1
                ",
            )
            .bind(policy_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error(&e))?;

            row.map(|row| policy_from_row(policy_id, &row)).transpose()
        })
    }
}
