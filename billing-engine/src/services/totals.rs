//! Invoice totals calculator.
//!
//! Pure and side-effect free: every invoice mutation recomputes monetary
//! state from the full item and payment lists instead of patching deltas,
//! so the stored fields always satisfy
//! `total_amount = subtotal - discount_amount + tax_amount` and
//! `balance = total_amount - paid_amount` exactly.

use crate::models::{InvoiceItem, PaymentTransaction};
use rust_decimal::{Decimal, RoundingStrategy};

/// Recomputed monetary state of an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub balance: Decimal,
}

/// Round a monetary amount to cents.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Derived line total for an item.
pub fn line_total(quantity: Decimal, unit_price: Decimal) -> Decimal {
    round_money(quantity * unit_price)
}

/// Recompute invoice totals from item and payment lists.
///
/// When `discount_percentage` is non-zero it takes precedence and the
/// discount amount is derived from the subtotal; otherwise the explicit
/// `discount_amount` applies. `balance` may go negative (patient credit);
/// refusing to create new credit is payment-workflow policy, not a
/// calculator concern.
pub fn calculate(
    items: &[InvoiceItem],
    payments: &[PaymentTransaction],
    discount_amount: Decimal,
    discount_percentage: Decimal,
    tax_amount: Decimal,
) -> InvoiceTotals {
    let subtotal = round_money(items.iter().map(|i| i.total_price).sum::<Decimal>());

    let discount = if discount_percentage > Decimal::ZERO {
        round_money(subtotal * discount_percentage / Decimal::ONE_HUNDRED)
    } else {
        round_money(discount_amount)
    };

    let tax = round_money(tax_amount);
    let total_amount = subtotal - discount + tax;
    let paid_amount = round_money(payments.iter().map(|p| p.amount).sum::<Decimal>());
    let balance = total_amount - paid_amount;

    InvoiceTotals {
        subtotal,
        discount_amount: discount,
        discount_percentage,
        tax_amount: tax,
        total_amount,
        paid_amount,
        balance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::str::FromStr;
    use uuid::Uuid;

    fn money(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn item(quantity: &str, unit_price: &str) -> InvoiceItem {
        let quantity = money(quantity);
        let unit_price = money(unit_price);
        InvoiceItem {
            item_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            item_type: "service".to_string(),
            description: "Consultation".to_string(),
            quantity,
            unit_price,
            total_price: line_total(quantity, unit_price),
            created_utc: Utc::now(),
        }
    }

    fn payment(amount: &str) -> PaymentTransaction {
        PaymentTransaction {
            payment_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            amount: money(amount),
            payment_method: "cash".to_string(),
            reference: None,
            received_by: "cashier".to_string(),
            processed_by: None,
            created_utc: Utc::now(),
        }
    }

    fn assert_invariants(t: &InvoiceTotals) {
        assert_eq!(t.total_amount, t.subtotal - t.discount_amount + t.tax_amount);
        assert_eq!(t.balance, t.total_amount - t.paid_amount);
    }

    #[test]
    fn empty_invoice_is_all_zero() {
        let totals = calculate(&[], &[], Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
        assert_eq!(totals.subtotal, Decimal::ZERO);
        assert_eq!(totals.total_amount, Decimal::ZERO);
        assert_eq!(totals.balance, Decimal::ZERO);
        assert_invariants(&totals);
    }

    #[test]
    fn subtotal_sums_line_totals() {
        let items = vec![item("2", "25.00"), item("1", "10.50")];
        let totals = calculate(&items, &[], Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
        assert_eq!(totals.subtotal, money("60.50"));
        assert_eq!(totals.total_amount, money("60.50"));
        assert_invariants(&totals);
    }

    #[test]
    fn explicit_discount_and_tax() {
        let items = vec![item("1", "100.00")];
        let totals = calculate(&items, &[], money("15.00"), Decimal::ZERO, money("5.00"));
        assert_eq!(totals.total_amount, money("90.00"));
        assert_invariants(&totals);
    }

    #[test]
    fn percentage_discount_takes_precedence() {
        let items = vec![item("1", "200.00")];
        let totals = calculate(&items, &[], money("15.00"), money("10"), Decimal::ZERO);
        assert_eq!(totals.discount_amount, money("20.00"));
        assert_eq!(totals.total_amount, money("180.00"));
        assert_invariants(&totals);
    }

    #[test]
    fn percentage_discount_rounds_to_cents() {
        let items = vec![item("1", "33.33")];
        // 7.5% of 33.33 = 2.49975 -> 2.50
        let totals = calculate(&items, &[], Decimal::ZERO, money("7.5"), Decimal::ZERO);
        assert_eq!(totals.discount_amount, money("2.50"));
        assert_invariants(&totals);
    }

    #[test]
    fn payments_reduce_balance() {
        let items = vec![item("1", "100.00")];
        let payments = vec![payment("60.00"), payment("15.00")];
        let totals = calculate(&items, &payments, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
        assert_eq!(totals.paid_amount, money("75.00"));
        assert_eq!(totals.balance, money("25.00"));
        assert_invariants(&totals);
    }

    #[test]
    fn overpayment_yields_negative_balance() {
        let items = vec![item("1", "50.00")];
        let payments = vec![payment("80.00")];
        let totals = calculate(&items, &payments, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
        assert_eq!(totals.balance, money("-30.00"));
        assert_invariants(&totals);
    }

    #[test]
    fn line_total_rounds_half_away_from_zero() {
        // 3 * 1.115 = 3.345 -> 3.35
        assert_eq!(line_total(money("3"), money("1.115")), money("3.35"));
    }
}
