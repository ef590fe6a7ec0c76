//! Financial precision utilities for accurate money calculations.
//!
//! # Design Philosophy
//!
//! - All internal calculations use i64 cents (1/100 of a dollar)
//! - The store keeps balances as fixed-point NUMERIC(12,2); conversion to
//!   and from `Decimal` happens only at the db boundary
//! - The wire carries dollar amounts as decimal strings with two fractional
//!   digits; book prices stay plain integers

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Money value stored as cents (i64) for precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money {
    cents: i64,
}

impl Money {
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    #[inline]
    pub const fn zero() -> Self {
        Self { cents: 0 }
    }

    #[inline]
    pub const fn cents(&self) -> i64 {
        self.cents
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.cents == 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.cents < 0
    }

    /// Fixed-point decimal for the store boundary (two fractional digits).
    #[inline]
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.cents, 2)
    }

    /// Read back from a NUMERIC(12,2) column. Rounds to the nearest cent in
    /// case the column ever carries more precision than it should.
    pub fn from_decimal(value: Decimal) -> Self {
        let cents = (value * Decimal::new(100, 0))
            .round()
            .to_i64()
            .unwrap_or(0);
        Self { cents }
    }

    /// Wire form: decimal string with exactly two fractional digits.
    pub fn to_wire(&self) -> String {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.unsigned_abs();
        format!("{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            cents: self.cents + other.cents,
        }
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.cents += other.cents;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self {
            cents: self.cents - other.cents,
        }
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.cents -= other.cents;
    }
}

impl Neg for Money {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self { cents: -self.cents }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cents < 0 {
            write!(f, "-${}", Money::from_cents(-self.cents).to_wire())
        } else {
            write!(f, "${}", self.to_wire())
        }
    }
}

// ============================================================================
// Standalone conversion functions
// ============================================================================

/// Convert cents to the store's fixed-point decimal.
#[inline]
pub fn cents_to_decimal(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Convert a NUMERIC(12,2) value to cents, rounding to the nearest cent.
#[inline]
pub fn decimal_to_cents(value: Decimal) -> i64 {
    Money::from_decimal(value).cents()
}

/// Wire form of a cent amount: "12.34".
#[inline]
pub fn cents_to_wire(cents: i64) -> String {
    Money::from_cents(cents).to_wire()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_round_trip() {
        let m = Money::from_cents(12345);
        assert_eq!(m.to_decimal(), Decimal::new(12345, 2));
        assert_eq!(Money::from_decimal(m.to_decimal()), m);
    }

    #[test]
    fn test_from_decimal_rounds_to_cent() {
        // 1.005 dollars rounds to 101 or 100 cents depending on the rounding
        // midpoint strategy; Decimal::round is banker's rounding
        assert_eq!(Money::from_decimal(Decimal::new(1004, 3)).cents(), 100);
        assert_eq!(Money::from_decimal(Decimal::new(1006, 3)).cents(), 101);
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(cents_to_wire(0), "0.00");
        assert_eq!(cents_to_wire(5), "0.05");
        assert_eq!(cents_to_wire(360), "3.60");
        assert_eq!(cents_to_wire(100000), "1000.00");
        assert_eq!(cents_to_wire(-1234), "-12.34");
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_cents(100);
        let b = Money::from_cents(35);
        assert_eq!((a + b).cents(), 135);
        assert_eq!((a - b).cents(), 65);
        assert_eq!((-a).cents(), -100);

        let mut c = Money::zero();
        assert!(c.is_zero());
        c += a;
        c -= b;
        assert_eq!(c.cents(), 65);
        assert!(!(c - a).is_zero());
        assert!((c - a).is_negative());
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(123).to_string(), "$1.23");
        assert_eq!(Money::from_cents(-456).to_string(), "-$4.56");
    }

    #[test]
    fn test_precision_no_accumulation() {
        let mut total = Money::zero();
        for _ in 0..1000 {
            total += Money::from_cents(1);
        }
        assert_eq!(total.cents(), 1000);
        assert_eq!(total.to_wire(), "10.00");
    }
}
