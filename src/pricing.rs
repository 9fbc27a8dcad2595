//! Cart totals.

use serde::Deserialize;

use crate::remote::Item;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
  /// Fraction of the subtotal taken off (0.2 = 20%)
  pub discount_rate: f64,
  /// Flat fee added to every non-empty cart
  pub delivery_fee: f64,
}

impl Default for PricingConfig {
  fn default() -> Self {
    Self {
      discount_rate: 0.2,
      delivery_fee: 15.98,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CartTotals {
  pub subtotal: f64,
  pub discount: f64,
  pub delivery_fee: f64,
  pub total: f64,
}

/// Totals for the given lines, rounded to cents
pub fn totals(items: &[Item], pricing: &PricingConfig) -> CartTotals {
  if items.iter().all(|i| i.quantity == 0) {
    return CartTotals::default();
  }

  let subtotal: f64 = items.iter().map(|i| i.price * f64::from(i.quantity)).sum();
  let discount = subtotal * pricing.discount_rate;

  CartTotals {
    subtotal: cents(subtotal),
    discount: cents(discount),
    delivery_fee: pricing.delivery_fee,
    total: cents(subtotal - discount + pricing.delivery_fee),
  }
}

fn cents(amount: f64) -> f64 {
  (amount * 100.0).round() / 100.0
}
