//! Postgres-backed store for the billing engine.
//!
//! All invoice writes go through a single conditional UPDATE: the version
//! check happens in the WHERE clause of the statement itself, so a
//! concurrent commit between read and write can never be overwritten.

use crate::error::{BillingError, StorageError};
use crate::models::{
    CreateInvoice, CreateInvoiceItem, Invoice, InvoiceItem, InvoicePatch, PaymentTransaction,
    RecordPayment, UpdateInvoiceItem,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::BillingStore;
use crate::services::totals;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const INVOICE_COLUMNS: &str = "invoice_id, patient_id, visit_id, status, version, \
    subtotal, discount_amount, discount_percentage, tax_amount, total_amount, paid_amount, balance, \
    on_hold, hold_reason, hold_date, completed_by, completed_at, created_utc, updated_utc";

const ITEM_COLUMNS: &str =
    "item_id, invoice_id, item_type, description, quantity, unit_price, total_price, created_utc";

const PAYMENT_COLUMNS: &str = "payment_id, invoice_id, amount, payment_method, reference, \
    received_by, processed_by, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Classify a sqlx failure for the retry layer: connection-level problems
/// are transient, everything else is permanent.
fn storage_error(context: &str, e: sqlx::Error) -> BillingError {
    let transient = matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    );
    let source = anyhow::anyhow!("{context}: {e}");
    BillingError::Storage(if transient {
        StorageError::transient(source)
    } else {
        StorageError::permanent(source)
    })
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, BillingError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| storage_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), BillingError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("Health check failed", e))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), BillingError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                BillingError::Storage(StorageError::permanent(anyhow::anyhow!(
                    "Migration failed: {e}"
                )))
            })?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self, input), fields(patient_id = %input.patient_id))]
    async fn insert_invoice(&self, input: &CreateInvoice) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let initial = totals::calculate(
            &[],
            &[],
            input.discount_amount,
            input.discount_percentage,
            input.tax_amount,
        );

        let invoice_id = Uuid::new_v4();
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (
                invoice_id, patient_id, visit_id, status, version,
                subtotal, discount_amount, discount_percentage, tax_amount,
                total_amount, paid_amount, balance, on_hold
            )
            VALUES ($1, $2, $3, 'pending', 1, $4, $5, $6, $7, $8, $9, $10, FALSE)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(input.patient_id)
        .bind(input.visit_id)
        .bind(initial.subtotal)
        .bind(initial.discount_amount)
        .bind(initial.discount_percentage)
        .bind(initial.tax_amount)
        .bind(initial.total_amount)
        .bind(initial.paid_amount)
        .bind(initial.balance)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to create invoice", e))?;

        timer.observe_duration();

        info!(invoice_id = %invoice.invoice_id, "Invoice created");

        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE invoice_id = $1
            "#
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to get invoice", e))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self, patch), fields(invoice_id = %invoice_id))]
    async fn update_invoice(
        &self,
        invoice_id: Uuid,
        expected_version: Option<i64>,
        patch: &InvoicePatch,
    ) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let status = patch.status.map(|s| s.as_str().to_string());
        let hold_present = patch.hold.is_some();
        let on_hold = patch.hold.as_ref().map(|h| h.on_hold);
        let hold_reason = patch.hold.as_ref().and_then(|h| h.reason.clone());
        let hold_date = patch.hold.as_ref().and_then(|h| h.date);
        let completion_present = patch.completion.is_some();
        let completed_by = patch.completion.as_ref().and_then(|c| c.completed_by.clone());
        let completed_at = patch.completion.as_ref().and_then(|c| c.completed_at);

        let updated = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET status = COALESCE($3, status),
                subtotal = COALESCE($4, subtotal),
                discount_amount = COALESCE($5, discount_amount),
                discount_percentage = COALESCE($6, discount_percentage),
                tax_amount = COALESCE($7, tax_amount),
                total_amount = COALESCE($8, total_amount),
                paid_amount = COALESCE($9, paid_amount),
                balance = COALESCE($10, balance),
                on_hold = CASE WHEN $11 THEN $12 ELSE on_hold END,
                hold_reason = CASE WHEN $11 THEN $13 ELSE hold_reason END,
                hold_date = CASE WHEN $11 THEN $14 ELSE hold_date END,
                completed_by = CASE WHEN $15 THEN $16 ELSE completed_by END,
                completed_at = CASE WHEN $15 THEN $17 ELSE completed_at END,
                version = version + 1,
                updated_utc = NOW()
            WHERE invoice_id = $1 AND ($2::bigint IS NULL OR version = $2)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(expected_version)
        .bind(status)
        .bind(patch.subtotal)
        .bind(patch.discount_amount)
        .bind(patch.discount_percentage)
        .bind(patch.tax_amount)
        .bind(patch.total_amount)
        .bind(patch.paid_amount)
        .bind(patch.balance)
        .bind(hold_present)
        .bind(on_hold)
        .bind(hold_reason)
        .bind(hold_date)
        .bind(completion_present)
        .bind(completed_by)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to update invoice", e))?;

        timer.observe_duration();

        match updated {
            Some(invoice) => Ok(invoice),
            // Zero rows: either the invoice is gone or someone else
            // committed first. Refetch to tell the two apart.
            None => match self.get_invoice(invoice_id).await? {
                None => Err(BillingError::InvoiceNotFound(invoice_id)),
                Some(current) => match expected_version {
                    Some(expected) => Err(BillingError::VersionMismatch {
                        invoice_id,
                        current_version: current.version,
                        expected_version: expected,
                    }),
                    None => Err(BillingError::Storage(StorageError::permanent(
                        anyhow::anyhow!("unconditional invoice update matched no rows"),
                    ))),
                },
            },
        }
    }

    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id))]
    async fn insert_item(&self, input: &CreateInvoiceItem) -> Result<InvoiceItem, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_item"])
            .start_timer();

        let item_id = Uuid::new_v4();
        let total_price = totals::line_total(input.quantity, input.unit_price);
        let item = sqlx::query_as::<_, InvoiceItem>(&format!(
            r#"
            INSERT INTO invoice_items (
                item_id, invoice_id, item_type, description, quantity, unit_price, total_price
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(item_id)
        .bind(input.invoice_id)
        .bind(input.item_type.as_str())
        .bind(&input.description)
        .bind(input.quantity)
        .bind(input.unit_price)
        .bind(total_price)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to insert item", e))?;

        timer.observe_duration();

        info!(item_id = %item.item_id, "Invoice item added");

        Ok(item)
    }

    #[instrument(skip(self, input), fields(invoice_id = %invoice_id, item_id = %item_id))]
    async fn update_item(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
        input: &UpdateInvoiceItem,
    ) -> Result<Option<InvoiceItem>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_item"])
            .start_timer();

        // total_price is derived inside the statement so a partial update
        // can never leave it stale.
        let item = sqlx::query_as::<_, InvoiceItem>(&format!(
            r#"
            UPDATE invoice_items
            SET description = COALESCE($3, description),
                quantity = COALESCE($4, quantity),
                unit_price = COALESCE($5, unit_price),
                total_price = ROUND(COALESCE($4, quantity) * COALESCE($5, unit_price), 2)
            WHERE invoice_id = $1 AND item_id = $2
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(item_id)
        .bind(&input.description)
        .bind(input.quantity)
        .bind(input.unit_price)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to update item", e))?;

        timer.observe_duration();

        Ok(item)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id, item_id = %item_id))]
    async fn delete_item(&self, invoice_id: Uuid, item_id: Uuid) -> Result<bool, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_item"])
            .start_timer();

        let result = sqlx::query(
            r#"
            DELETE FROM invoice_items
            WHERE invoice_id = $1 AND item_id = $2
            "#,
        )
        .bind(invoice_id)
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to delete item", e))?;

        timer.observe_duration();

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, item), fields(invoice_id = %item.invoice_id, item_id = %item.item_id))]
    async fn restore_item(&self, item: &InvoiceItem) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["restore_item"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO invoice_items (
                item_id, invoice_id, item_type, description, quantity, unit_price, total_price, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(item.item_id)
        .bind(item.invoice_id)
        .bind(&item.item_type)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.total_price)
        .bind(item.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to restore item", e))?;

        timer.observe_duration();

        info!(item_id = %item.item_id, "Invoice item restored by compensation");

        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn list_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceItem>(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY created_utc, item_id
            "#
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to list items", e))?;

        timer.observe_duration();

        Ok(items)
    }

    #[instrument(skip(self, input), fields(invoice_id = %invoice_id))]
    async fn insert_payment(
        &self,
        invoice_id: Uuid,
        input: &RecordPayment,
    ) -> Result<PaymentTransaction, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let payment_id = Uuid::new_v4();
        let payment = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            INSERT INTO payment_transactions (
                payment_id, invoice_id, amount, payment_method, reference, received_by, processed_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(invoice_id)
        .bind(input.amount)
        .bind(&input.payment_method)
        .bind(&input.reference)
        .bind(&input.received_by)
        .bind(&input.processed_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to insert payment", e))?;

        timer.observe_duration();

        info!(
            payment_id = %payment.payment_id,
            amount = %payment.amount,
            "Payment transaction recorded"
        );

        Ok(payment)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn delete_payment(&self, payment_id: Uuid) -> Result<bool, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_payment"])
            .start_timer();

        let result = sqlx::query(
            r#"
            DELETE FROM payment_transactions
            WHERE payment_id = $1
            "#,
        )
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to delete payment", e))?;

        timer.observe_duration();

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(payment_id = %payment_id, "Payment transaction removed by compensation");
        }

        Ok(deleted)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn list_payments(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<PaymentTransaction>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let payments = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payment_transactions
            WHERE invoice_id = $1
            ORDER BY created_utc, payment_id
            "#
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to list payments", e))?;

        timer.observe_duration();

        Ok(payments)
    }
}
