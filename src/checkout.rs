//! Rules for turning a cart into an order and for moving an order through its lifecycle.
//!
//! Everything here is free of I/O: the services load rows inside a transaction, hand them to
//! these functions, and persist whatever comes back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entity::{cart_items, products},
    error::AppError,
    models::{OrderStatus, PaymentMethod, PaymentStatus, ProductStatus},
};

/// Flat shipping fee, waived once the subtotal reaches `free_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingPolicy {
    pub flat_fee: i64,
    pub free_threshold: Option<i64>,
}

impl ShippingPolicy {
    pub fn fee_for(&self, subtotal: i64) -> i64 {
        match self.free_threshold {
            Some(threshold) if subtotal >= threshold => 0,
            _ => self.flat_fee,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    pub seller_id: Uuid,
    pub product_name: String,
    pub variant: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
    pub line_total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: i64,
    pub shipping_fee: i64,
    pub total: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckoutError {
    #[error("Cart is empty")]
    EmptyCart,
    #[error("Invalid quantity for product {0}")]
    InvalidQuantity(Uuid),
    #[error("Product {0} is no longer available")]
    ProductUnavailable(Uuid),
    #[error("Insufficient stock for {name}: requested {requested}, available {available}")]
    InsufficientStock {
        name: String,
        requested: i64,
        available: i32,
    },
    #[error("Invalid variant for {0}")]
    InvalidVariant(String),
    #[error("Order amount is too large")]
    AmountOverflow,
    #[error("Cannot change order status from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("Payment must be verified before the order can be processed")]
    PaymentRequired,
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// A variant must be picked from the product's list; products without variants take none.
pub fn validate_variant(
    product: &products::Model,
    variant: Option<&str>,
) -> Result<(), CheckoutError> {
    let variants = product.variant_list();
    let ok = match variant {
        None => variants.is_empty(),
        Some(v) => variants.iter().any(|known| known == v),
    };
    if ok {
        Ok(())
    } else {
        Err(CheckoutError::InvalidVariant(product.name.clone()))
    }
}

/// Fails unless the product is active and `requested` units fit in its stock.
pub fn ensure_purchasable(product: &products::Model, requested: i64) -> Result<(), CheckoutError> {
    if product.status != ProductStatus::Active {
        return Err(CheckoutError::ProductUnavailable(product.id));
    }
    if requested > i64::from(product.stock) {
        return Err(CheckoutError::InsufficientStock {
            name: product.name.clone(),
            requested,
            available: product.stock,
        });
    }
    Ok(())
}

/// Validates every cart item against the live product rows and freezes their prices.
///
/// Quantities of the same product in different variants are summed before the stock check.
pub fn build_lines(
    items: &[cart_items::Model],
    products: &HashMap<Uuid, products::Model>,
) -> Result<Vec<CheckoutLine>, CheckoutError> {
    if items.is_empty() {
        return Err(CheckoutError::EmptyCart);
    }

    let mut requested: HashMap<Uuid, i64> = HashMap::new();
    let mut lines = Vec::with_capacity(items.len());

    for item in items {
        if item.quantity <= 0 {
            return Err(CheckoutError::InvalidQuantity(item.product_id));
        }
        let product = products
            .get(&item.product_id)
            .ok_or(CheckoutError::ProductUnavailable(item.product_id))?;
        validate_variant(product, item.variant.as_deref())?;

        let total_for_product = requested.entry(product.id).or_insert(0);
        *total_for_product += i64::from(item.quantity);
        ensure_purchasable(product, *total_for_product)?;

        let line_total = product
            .price
            .checked_mul(i64::from(item.quantity))
            .ok_or(CheckoutError::AmountOverflow)?;

        lines.push(CheckoutLine {
            product_id: product.id,
            seller_id: product.seller_id,
            product_name: product.name.clone(),
            variant: item.variant.clone(),
            quantity: item.quantity,
            unit_price: product.price,
            line_total,
        });
    }

    Ok(lines)
}

pub fn compute_totals(
    lines: &[CheckoutLine],
    policy: &ShippingPolicy,
) -> Result<OrderTotals, CheckoutError> {
    let subtotal = lines
        .iter()
        .try_fold(0i64, |acc, line| acc.checked_add(line.line_total))
        .ok_or(CheckoutError::AmountOverflow)?;
    let shipping_fee = policy.fee_for(subtotal);
    let total = subtotal
        .checked_add(shipping_fee)
        .ok_or(CheckoutError::AmountOverflow)?;
    Ok(OrderTotals {
        subtotal,
        shipping_fee,
        total,
    })
}

/// Checks a requested status change against the lifecycle and the order's payment.
pub fn ensure_status_change(
    current: OrderStatus,
    next: OrderStatus,
    method: PaymentMethod,
    payment_status: PaymentStatus,
) -> Result<(), CheckoutError> {
    if !current.can_transition_to(next) {
        return Err(CheckoutError::InvalidTransition {
            from: current.as_str(),
            to: next.as_str(),
        });
    }
    if next == OrderStatus::Processing
        && method == PaymentMethod::BankTransfer
        && payment_status != PaymentStatus::Paid
    {
        return Err(CheckoutError::PaymentRequired);
    }
    Ok(())
}

pub fn order_number(order_id: Uuid, now: DateTime<Utc>) -> String {
    let date = now.format("%Y%m%d");
    let suffix = order_id.simple().to_string();
    format!("ORD-{}-{}", date, suffix[..8].to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn product(name: &str, price: i64, stock: i32, variants: &[&str]) -> products::Model {
        let now = Utc::now().fixed_offset();
        products::Model {
            id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            category_id: None,
            name: name.to_string(),
            description: None,
            price,
            stock,
            status: ProductStatus::Active,
            variants: serde_json::json!(variants),
            images: serde_json::json!([]),
            created_at: now,
            updated_at: now,
        }
    }

    fn item(product_id: Uuid, quantity: i32, variant: Option<&str>) -> cart_items::Model {
        let now = Utc::now().fixed_offset();
        cart_items::Model {
            id: Uuid::new_v4(),
            cart_id: Uuid::nil(),
            product_id,
            quantity,
            variant: variant.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }

    fn catalog(products: Vec<products::Model>) -> HashMap<Uuid, products::Model> {
        products.into_iter().map(|p| (p.id, p)).collect()
    }

    const POLICY: ShippingPolicy = ShippingPolicy {
        flat_fee: 20_000,
        free_threshold: Some(500_000),
    };

    #[test]
    fn freezes_prices_and_computes_totals() {
        let mug = product("Mug", 120_000, 10, &[]);
        let shirt = product("Shirt", 90_000, 5, &["S", "M"]);
        let items = vec![item(mug.id, 2, None), item(shirt.id, 1, Some("M"))];
        let lines = build_lines(&items, &catalog(vec![mug.clone(), shirt.clone()])).unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].unit_price, 120_000);
        assert_eq!(lines[0].line_total, 240_000);
        assert_eq!(lines[0].seller_id, mug.seller_id);
        assert_eq!(lines[1].variant.as_deref(), Some("M"));

        let totals = compute_totals(&lines, &POLICY).unwrap();
        assert_eq!(totals.subtotal, 330_000);
        assert_eq!(totals.shipping_fee, 20_000);
        assert_eq!(totals.total, 350_000);
    }

    #[test]
    fn shipping_is_free_at_threshold() {
        assert_eq!(POLICY.fee_for(499_999), 20_000);
        assert_eq!(POLICY.fee_for(500_000), 0);
        let no_threshold = ShippingPolicy {
            flat_fee: 15_000,
            free_threshold: None,
        };
        assert_eq!(no_threshold.fee_for(10_000_000), 15_000);
    }

    #[test]
    fn rejects_empty_cart() {
        assert_eq!(
            build_lines(&[], &HashMap::new()),
            Err(CheckoutError::EmptyCart)
        );
    }

    #[test]
    fn rejects_missing_or_inactive_product() {
        let ghost = Uuid::new_v4();
        assert_eq!(
            build_lines(&[item(ghost, 1, None)], &HashMap::new()),
            Err(CheckoutError::ProductUnavailable(ghost))
        );

        let mut hidden = product("Hidden", 1_000, 10, &[]);
        hidden.status = ProductStatus::Inactive;
        let id = hidden.id;
        assert_eq!(
            build_lines(&[item(id, 1, None)], &catalog(vec![hidden])),
            Err(CheckoutError::ProductUnavailable(id))
        );
    }

    #[test]
    fn stock_check_sums_variants_of_the_same_product() {
        let shirt = product("Shirt", 90_000, 3, &["S", "M"]);
        let items = vec![item(shirt.id, 2, Some("S")), item(shirt.id, 2, Some("M"))];
        let err = build_lines(&items, &catalog(vec![shirt])).unwrap_err();
        assert_eq!(
            err,
            CheckoutError::InsufficientStock {
                name: "Shirt".into(),
                requested: 4,
                available: 3,
            }
        );
    }

    #[test]
    fn rejects_unknown_or_missing_variant() {
        let shirt = product("Shirt", 90_000, 3, &["S", "M"]);
        assert!(validate_variant(&shirt, Some("XL")).is_err());
        assert!(validate_variant(&shirt, None).is_err());
        assert!(validate_variant(&shirt, Some("S")).is_ok());

        let mug = product("Mug", 1, 1, &[]);
        assert!(validate_variant(&mug, None).is_ok());
        assert!(validate_variant(&mug, Some("Blue")).is_err());
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let mug = product("Mug", 1_000, 10, &[]);
        let id = mug.id;
        assert_eq!(
            build_lines(&[item(id, 0, None)], &catalog(vec![mug])),
            Err(CheckoutError::InvalidQuantity(id))
        );
    }

    #[test]
    fn detects_amount_overflow() {
        let gold = product("Gold", i64::MAX / 2, 10, &[]);
        let items = vec![item(gold.id, 3, None)];
        assert_eq!(
            build_lines(&items, &catalog(vec![gold])),
            Err(CheckoutError::AmountOverflow)
        );
    }

    #[test]
    fn bank_transfer_must_be_paid_before_processing() {
        assert_eq!(
            ensure_status_change(
                OrderStatus::Pending,
                OrderStatus::Processing,
                PaymentMethod::BankTransfer,
                PaymentStatus::Pending,
            ),
            Err(CheckoutError::PaymentRequired)
        );
        assert!(
            ensure_status_change(
                OrderStatus::Pending,
                OrderStatus::Processing,
                PaymentMethod::BankTransfer,
                PaymentStatus::Paid,
            )
            .is_ok()
        );
        assert!(
            ensure_status_change(
                OrderStatus::Pending,
                OrderStatus::Processing,
                PaymentMethod::CashOnDelivery,
                PaymentStatus::Pending,
            )
            .is_ok()
        );
    }

    #[test]
    fn rejects_skipping_states() {
        let err = ensure_status_change(
            OrderStatus::Pending,
            OrderStatus::Delivered,
            PaymentMethod::CashOnDelivery,
            PaymentStatus::Pending,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot change order status from pending to delivered"
        );
    }

    #[test]
    fn order_number_embeds_date_and_id_prefix() {
        let id = Uuid::parse_str("a1b2c3d4-0000-4000-8000-000000000000").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(order_number(id, now), "ORD-20260309-A1B2C3D4");
    }
}
