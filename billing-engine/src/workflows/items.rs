//! Invoice item mutations.
//!
//! Items can change only while the invoice is editable, and every mutation
//! recomputes the invoice totals from the full item and payment lists
//! through the versioned store. The item write and the totals write are a
//! saga: a conflict on the invoice leaves no orphaned item change behind.
//!
//! Item mutations never change invoice status — in particular an item
//! removal that drops the total below the paid amount leaves the invoice
//! `partial_paid` with a credit balance; only the completion workflow moves
//! an invoice to `paid`.

use crate::error::BillingError;
use crate::gateways::{notify_best_effort, Audience, NotificationGateway};
use crate::models::{
    CreateInvoiceItem, Invoice, InvoiceItem, InvoicePatch, UpdateInvoiceItem,
};
use crate::services::metrics::{ERRORS_TOTAL, SAGA_ROLLBACKS_TOTAL};
use crate::services::saga::{Compensation, Saga, SagaFailure};
use crate::services::store::BillingStore;
use crate::services::totals;
use billing_core::retry::{retry_transient, RetryConfig};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

pub struct InvoiceItemWorkflow {
    store: Arc<dyn BillingStore>,
    notifications: Arc<dyn NotificationGateway>,
    retry: RetryConfig,
}

impl InvoiceItemWorkflow {
    pub fn new(store: Arc<dyn BillingStore>, notifications: Arc<dyn NotificationGateway>) -> Self {
        Self {
            store,
            notifications,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn observe<T>(result: Result<T, BillingError>) -> Result<T, BillingError> {
        if let Err(e) = &result {
            ERRORS_TOTAL.with_label_values(&[e.code()]).inc();
        }
        result
    }

    /// Load the invoice and require an editable status and a matching
    /// version before any item row is touched.
    async fn load_editable(
        &self,
        invoice_id: Uuid,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        let invoice = retry_transient(&self.retry, "get_invoice", || {
            self.store.get_invoice(invoice_id)
        })
        .await?
        .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        let status = invoice.status();
        if !status.is_editable() {
            return Err(BillingError::NotEditable { invoice_id, status });
        }

        if let Some(expected) = expected_version {
            if expected != invoice.version {
                return Err(BillingError::VersionMismatch {
                    invoice_id,
                    current_version: invoice.version,
                    expected_version: expected,
                });
            }
        }

        Ok(invoice)
    }

    /// Add an item and recompute the invoice.
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id))]
    pub async fn add_item(
        &self,
        input: CreateInvoiceItem,
        expected_version: Option<i64>,
    ) -> Result<(Invoice, InvoiceItem), BillingError> {
        Self::observe(self.add_inner(input, expected_version).await)
    }

    async fn add_inner(
        &self,
        input: CreateInvoiceItem,
        expected_version: Option<i64>,
    ) -> Result<(Invoice, InvoiceItem), BillingError> {
        validate_amounts(input.quantity, input.unit_price)?;
        let invoice_id = input.invoice_id;
        let invoice = self.load_editable(invoice_id, expected_version).await?;

        let mut saga: Saga<'static, BillingError> = Saga::new();

        let store = Arc::clone(&self.store);
        let item = match saga
            .run_compensable(
                "add item",
                self.store.insert_item(&input),
                move |it: &InvoiceItem| {
                    let item_id = it.item_id;
                    let compensation: Compensation<'static, BillingError> = Box::new(move || {
                        Box::pin(async move {
                            store.delete_item(invoice_id, item_id).await.map(|_| ())
                        })
                    });
                    compensation
                },
            )
            .await
        {
            Ok(it) => it,
            Err(failure) => return Err(self.resolve_saga_failure(invoice_id, failure).await),
        };

        let cas_version = expected_version.or(Some(invoice.version));
        let updated = match self.recalculate(&mut saga, &invoice, cas_version).await {
            Ok(inv) => inv,
            Err(failure) => return Err(self.resolve_saga_failure(invoice_id, failure).await),
        };
        saga.commit();

        info!(invoice_id = %invoice_id, item_id = %item.item_id, total = %updated.total_amount, "Item added");

        Ok((updated, item))
    }

    /// Update an item and recompute the invoice.
    #[instrument(skip(self, input), fields(invoice_id = %invoice_id, item_id = %item_id))]
    pub async fn update_item(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
        input: UpdateInvoiceItem,
        expected_version: Option<i64>,
    ) -> Result<(Invoice, InvoiceItem), BillingError> {
        Self::observe(
            self.update_inner(invoice_id, item_id, input, expected_version)
                .await,
        )
    }

    async fn update_inner(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
        input: UpdateInvoiceItem,
        expected_version: Option<i64>,
    ) -> Result<(Invoice, InvoiceItem), BillingError> {
        if let Some(quantity) = input.quantity {
            if quantity <= Decimal::ZERO {
                return Err(BillingError::InvalidItem(
                    "quantity must be positive".to_string(),
                ));
            }
        }
        if let Some(unit_price) = input.unit_price {
            if unit_price < Decimal::ZERO {
                return Err(BillingError::InvalidItem(
                    "unit price cannot be negative".to_string(),
                ));
            }
        }

        let invoice = self.load_editable(invoice_id, expected_version).await?;

        let existing = retry_transient(&self.retry, "list_items", || {
            self.store.list_items(invoice_id)
        })
        .await?
        .into_iter()
        .find(|it| it.item_id == item_id)
        .ok_or(BillingError::ItemNotFound {
            invoice_id,
            item_id,
        })?;

        let mut saga: Saga<'static, BillingError> = Saga::new();

        let store = Arc::clone(&self.store);
        let restore = UpdateInvoiceItem::restoring(&existing);
        let forward = async {
            self.store
                .update_item(invoice_id, item_id, &input)
                .await?
                .ok_or(BillingError::ItemNotFound {
                    invoice_id,
                    item_id,
                })
        };
        let item = match saga
            .run_compensable("update item", forward, move |_| {
                let compensation: Compensation<'static, BillingError> = Box::new(move || {
                    Box::pin(async move {
                        store
                            .update_item(invoice_id, item_id, &restore)
                            .await
                            .map(|_| ())
                    })
                });
                compensation
            })
            .await
        {
            Ok(it) => it,
            Err(failure) => return Err(self.resolve_saga_failure(invoice_id, failure).await),
        };

        let cas_version = expected_version.or(Some(invoice.version));
        let updated = match self.recalculate(&mut saga, &invoice, cas_version).await {
            Ok(inv) => inv,
            Err(failure) => return Err(self.resolve_saga_failure(invoice_id, failure).await),
        };
        saga.commit();

        info!(invoice_id = %invoice_id, item_id = %item_id, total = %updated.total_amount, "Item updated");

        Ok((updated, item))
    }

    /// Remove an item and recompute the invoice.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, item_id = %item_id))]
    pub async fn remove_item(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        Self::observe(
            self.remove_inner(invoice_id, item_id, expected_version)
                .await,
        )
    }

    async fn remove_inner(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load_editable(invoice_id, expected_version).await?;

        let existing = retry_transient(&self.retry, "list_items", || {
            self.store.list_items(invoice_id)
        })
        .await?
        .into_iter()
        .find(|it| it.item_id == item_id)
        .ok_or(BillingError::ItemNotFound {
            invoice_id,
            item_id,
        })?;

        let mut saga: Saga<'static, BillingError> = Saga::new();

        let store = Arc::clone(&self.store);
        let forward = async {
            if self.store.delete_item(invoice_id, item_id).await? {
                Ok(())
            } else {
                Err(BillingError::ItemNotFound {
                    invoice_id,
                    item_id,
                })
            }
        };
        if let Err(failure) = saga
            .run_compensable("remove item", forward, move |_| {
                let compensation: Compensation<'static, BillingError> = Box::new(move || {
                    Box::pin(async move { store.restore_item(&existing).await })
                });
                compensation
            })
            .await
        {
            return Err(self.resolve_saga_failure(invoice_id, failure).await);
        }

        let cas_version = expected_version.or(Some(invoice.version));
        let updated = match self.recalculate(&mut saga, &invoice, cas_version).await {
            Ok(inv) => inv,
            Err(failure) => return Err(self.resolve_saga_failure(invoice_id, failure).await),
        };
        saga.commit();

        info!(invoice_id = %invoice_id, item_id = %item_id, total = %updated.total_amount, "Item removed");

        Ok(updated)
    }

    /// Recompute totals from the full item and payment lists and write them
    /// back under the version check. Runs inside the caller's saga so a
    /// failure here also unwinds the item mutation.
    async fn recalculate(
        &self,
        saga: &mut Saga<'static, BillingError>,
        invoice: &Invoice,
        cas_version: Option<i64>,
    ) -> Result<Invoice, SagaFailure<BillingError>> {
        let items = saga
            .run("list items", self.store.list_items(invoice.invoice_id))
            .await?;
        let payments = saga
            .run("list payments", self.store.list_payments(invoice.invoice_id))
            .await?;

        let recomputed = totals::calculate(
            &items,
            &payments,
            invoice.discount_amount,
            invoice.discount_percentage,
            invoice.tax_amount,
        );

        let patch = InvoicePatch {
            subtotal: Some(recomputed.subtotal),
            discount_amount: Some(recomputed.discount_amount),
            tax_amount: Some(recomputed.tax_amount),
            total_amount: Some(recomputed.total_amount),
            paid_amount: Some(recomputed.paid_amount),
            balance: Some(recomputed.balance),
            ..Default::default()
        };

        saga.run(
            "apply totals to invoice",
            self.store
                .update_invoice(invoice.invoice_id, cas_version, &patch),
        )
        .await
    }

    async fn resolve_saga_failure(
        &self,
        invoice_id: Uuid,
        failure: SagaFailure<BillingError>,
    ) -> BillingError {
        match failure {
            SagaFailure::RolledBack { step, source } => {
                SAGA_ROLLBACKS_TOTAL
                    .with_label_values(&["items", "clean"])
                    .inc();
                tracing::debug!(invoice_id = %invoice_id, step, "item mutation rolled back");
                source
            }
            SagaFailure::RollbackIncomplete {
                step,
                source,
                compensation_failures,
            } => {
                SAGA_ROLLBACKS_TOTAL
                    .with_label_values(&["items", "incomplete"])
                    .inc();
                error!(
                    invoice_id = %invoice_id,
                    step,
                    failed_compensations = compensation_failures.len(),
                    "rollback incomplete; billing state is known-inconsistent"
                );
                notify_best_effort(
                    self.notifications.as_ref(),
                    Audience::Operators,
                    &format!(
                        "ROLLBACK INCOMPLETE on invoice {invoice_id}: '{step}' failed ({source}) \
                         and {} compensation(s) also failed; manual reconciliation required",
                        compensation_failures.len()
                    ),
                )
                .await;
                BillingError::RollbackIncomplete {
                    invoice_id,
                    step,
                    reason: source.to_string(),
                    failed_compensations: compensation_failures.len(),
                }
            }
        }
    }
}

fn validate_amounts(quantity: Decimal, unit_price: Decimal) -> Result<(), BillingError> {
    if quantity <= Decimal::ZERO {
        return Err(BillingError::InvalidItem(
            "quantity must be positive".to_string(),
        ));
    }
    if unit_price < Decimal::ZERO {
        return Err(BillingError::InvalidItem(
            "unit price cannot be negative".to_string(),
        ));
    }
    Ok(())
}
