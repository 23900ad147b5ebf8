use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::AppError;
use crate::models::{Coupon, CouponKind};

/// Orders above this subtotal ship free; below it a flat fee applies.
pub const FREE_SHIPPING_THRESHOLD: f64 = 500.0;
pub const FLAT_SHIPPING_FEE: f64 = 50.0;
/// Flat-rate tax applied to the post-discount subtotal.
pub const TAX_RATE: f64 = 0.18;

/// One priced line: the catalog price captured at order-creation time.
/// Client-supplied prices never reach this module.
#[derive(Debug, Clone, Copy)]
pub struct PricedLine {
    pub unit_price: f64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub subtotal: f64,
    pub discount: f64,
    pub shipping: f64,
    pub tax: f64,
    pub total: f64,
}

/// Every failed coupon check is a terminal error, never a silent zero
/// discount.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("coupon {0} is not active")]
    CouponInactive(String),
    #[error("coupon {0} is not valid yet")]
    CouponNotStarted(String),
    #[error("coupon {0} has expired")]
    CouponExpired(String),
    #[error("coupon {0} usage limit reached")]
    CouponExhausted(String),
    #[error("coupon {0} requires a minimum subtotal of {1}")]
    SubtotalBelowMinimum(String, String),
}

impl From<PricingError> for AppError {
    fn from(err: PricingError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Price an order. Pure: no storage, no clock reads (the caller supplies
/// `now` so coupon windows are checked against one instant).
///
/// All amounts are f64 major currency units; the sole integer conversion
/// happens at the gateway boundary via [`to_minor_units`].
pub fn price(
    lines: &[PricedLine],
    coupon: Option<&Coupon>,
    now: DateTime<Utc>,
) -> Result<Quote, PricingError> {
    let subtotal: f64 = lines
        .iter()
        .map(|l| l.unit_price * f64::from(l.quantity))
        .sum();

    let discount = match coupon {
        Some(c) => validate_and_discount(c, subtotal, now)?,
        None => 0.0,
    };

    let shipping = if subtotal > FREE_SHIPPING_THRESHOLD {
        0.0
    } else {
        FLAT_SHIPPING_FEE
    };

    let tax = (subtotal - discount) * TAX_RATE;
    let total = subtotal - discount + shipping + tax;

    Ok(Quote {
        subtotal,
        discount,
        shipping,
        tax,
        total,
    })
}

fn validate_and_discount(
    coupon: &Coupon,
    subtotal: f64,
    now: DateTime<Utc>,
) -> Result<f64, PricingError> {
    if !coupon.active {
        return Err(PricingError::CouponInactive(coupon.code.clone()));
    }
    if now < coupon.valid_from {
        return Err(PricingError::CouponNotStarted(coupon.code.clone()));
    }
    if now > coupon.valid_until {
        return Err(PricingError::CouponExpired(coupon.code.clone()));
    }
    if let Some(limit) = coupon.usage_limit {
        if coupon.usage_count >= limit {
            return Err(PricingError::CouponExhausted(coupon.code.clone()));
        }
    }
    if let Some(min) = coupon.min_subtotal {
        if subtotal < min {
            return Err(PricingError::SubtotalBelowMinimum(
                coupon.code.clone(),
                min.to_string(),
            ));
        }
    }

    let raw = match coupon.kind {
        CouponKind::Percent => {
            let d = subtotal * coupon.value / 100.0;
            match coupon.max_discount {
                Some(cap) => d.min(cap),
                None => d,
            }
        }
        CouponKind::Flat => coupon.value,
    };

    // A discount can never exceed what is being bought.
    Ok(raw.min(subtotal))
}

/// Convert a major-unit total to the integer minor units the payment gateway
/// expects. This is the documented rounding boundary for the whole pipeline.
pub fn to_minor_units(total: f64) -> i64 {
    (total * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn line(unit_price: f64, quantity: i32) -> PricedLine {
        PricedLine {
            unit_price,
            quantity,
        }
    }

    fn coupon(kind: CouponKind, value: f64) -> Coupon {
        let now = Utc::now();
        Coupon {
            code: "TEST10".into(),
            kind,
            value,
            min_subtotal: None,
            max_discount: None,
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(1),
            usage_limit: None,
            usage_count: 0,
            active: true,
        }
    }

    #[test]
    fn free_shipping_above_threshold() {
        let q = price(&[line(600.0, 1)], None, Utc::now()).unwrap();
        assert_eq!(q.subtotal, 600.0);
        assert_eq!(q.shipping, 0.0);
        assert_eq!(q.tax, 108.0);
        assert_eq!(q.total, 708.0);
    }

    #[test]
    fn flat_shipping_below_threshold_and_tax_on_subtotal_only() {
        let q = price(&[line(400.0, 1)], None, Utc::now()).unwrap();
        assert_eq!(q.shipping, 50.0);
        // Tax is computed on 400, not on 450.
        assert_eq!(q.tax, 72.0);
        assert_eq!(q.total, 522.0);
    }

    #[test]
    fn shipping_boundary_is_strictly_greater_than() {
        let q = price(&[line(500.0, 1)], None, Utc::now()).unwrap();
        assert_eq!(q.shipping, 50.0);
    }

    #[test]
    fn percent_coupon_capped_by_max_discount() {
        let mut c = coupon(CouponKind::Percent, 20.0);
        c.max_discount = Some(50.0);
        let q = price(&[line(1000.0, 1)], Some(&c), Utc::now()).unwrap();
        assert_eq!(q.discount, 50.0);
    }

    #[test]
    fn flat_coupon_never_exceeds_subtotal() {
        let c = coupon(CouponKind::Flat, 500.0);
        let q = price(&[line(100.0, 1)], Some(&c), Utc::now()).unwrap();
        assert_eq!(q.discount, 100.0);
        assert_eq!(q.total, 50.0); // shipping 50, tax on zero
    }

    #[test]
    fn tax_applies_after_discount() {
        let c = coupon(CouponKind::Flat, 100.0);
        let q = price(&[line(600.0, 1)], Some(&c), Utc::now()).unwrap();
        assert_eq!(q.discount, 100.0);
        assert_eq!(q.tax, 90.0);
        assert_eq!(q.total, 590.0);
    }

    #[test]
    fn inactive_coupon_is_an_error_not_zero_discount() {
        let mut c = coupon(CouponKind::Percent, 10.0);
        c.active = false;
        let err = price(&[line(100.0, 1)], Some(&c), Utc::now()).unwrap_err();
        assert_eq!(err, PricingError::CouponInactive("TEST10".into()));
    }

    #[test]
    fn coupon_window_is_checked_at_use_time() {
        let mut c = coupon(CouponKind::Percent, 10.0);
        c.valid_from = Utc::now() + Duration::days(1);
        c.valid_until = Utc::now() + Duration::days(2);
        assert!(matches!(
            price(&[line(100.0, 1)], Some(&c), Utc::now()),
            Err(PricingError::CouponNotStarted(_))
        ));

        c.valid_from = Utc::now() - Duration::days(2);
        c.valid_until = Utc::now() - Duration::days(1);
        assert!(matches!(
            price(&[line(100.0, 1)], Some(&c), Utc::now()),
            Err(PricingError::CouponExpired(_))
        ));
    }

    #[test]
    fn exhausted_coupon_rejected() {
        let mut c = coupon(CouponKind::Percent, 10.0);
        c.usage_limit = Some(5);
        c.usage_count = 5;
        assert!(matches!(
            price(&[line(100.0, 1)], Some(&c), Utc::now()),
            Err(PricingError::CouponExhausted(_))
        ));
    }

    #[test]
    fn min_subtotal_enforced() {
        let mut c = coupon(CouponKind::Percent, 10.0);
        c.min_subtotal = Some(500.0);
        assert!(matches!(
            price(&[line(100.0, 1)], Some(&c), Utc::now()),
            Err(PricingError::SubtotalBelowMinimum(_, _))
        ));
    }

    #[test]
    fn multi_line_subtotal() {
        let q = price(&[line(100.0, 2), line(250.0, 1)], None, Utc::now()).unwrap();
        assert_eq!(q.subtotal, 450.0);
        assert_eq!(q.shipping, 50.0);
        assert_eq!(q.tax, 81.0);
        assert_eq!(q.total, 581.0);
    }

    #[test]
    fn minor_units_round_half_up() {
        assert_eq!(to_minor_units(590.0), 59000);
        assert_eq!(to_minor_units(12.34), 1234);
        assert_eq!(to_minor_units(0.1 + 0.2), 30);
        assert_eq!(to_minor_units(0.0), 0);
    }
}
