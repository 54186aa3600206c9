//! Signed q17.14 fixed-point arithmetic.
//!
//! The feedback scheduler needs fractional load and CPU-usage figures, and a
//! kernel has no floating point to spend on them. Values are stored as an
//! `i32` scaled by `F = 1 << 14`: 17 integer bits, 14 fraction bits, one sign
//! bit. Products and quotients widen through `i64` so the intermediate cannot
//! overflow.

use core::ops::{Add, Div, Mul, Neg, Sub};

const F: i32 = 1 << 14;

/// A q17.14 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i32);

impl Fixed {
    /// The value 0.
    pub const ZERO: Fixed = Fixed(0);
    /// The value 1.
    pub const ONE: Fixed = Fixed(F);

    /// Converts an integer to fixed point.
    pub const fn from_int(n: i32) -> Self {
        Fixed(n * F)
    }

    /// Converts to an integer, truncating toward zero.
    pub const fn to_int(self) -> i32 {
        self.0 / F
    }

    /// Converts to an integer, rounding half away from zero.
    pub const fn round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    /// Adds an integer without converting it first.
    pub const fn add_int(self, n: i32) -> Self {
        Fixed(self.0 + n * F)
    }

    /// Subtracts an integer without converting it first.
    pub const fn sub_int(self, n: i32) -> Self {
        Fixed(self.0 - n * F)
    }

    /// Multiplies by an integer. No widening needed: the scale is unchanged.
    pub const fn mul_int(self, n: i32) -> Self {
        Fixed(self.0 * n)
    }

    /// Divides by an integer.
    ///
    /// # Panics
    /// Panics if `n` is zero.
    pub const fn div_int(self, n: i32) -> Self {
        Fixed(self.0 / n)
    }
}

impl Add for Fixed {
    type Output = Fixed;
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }
}

impl Sub for Fixed {
    type Output = Fixed;
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }
}

impl Neg for Fixed {
    type Output = Fixed;
    fn neg(self) -> Fixed {
        Fixed(-self.0)
    }
}

impl Mul for Fixed {
    type Output = Fixed;
    fn mul(self, rhs: Fixed) -> Fixed {
        Fixed(((self.0 as i64 * rhs.0 as i64) / F as i64) as i32)
    }
}

impl Div for Fixed {
    type Output = Fixed;

    /// # Panics
    /// Panics if `rhs` is zero.
    fn div(self, rhs: Fixed) -> Fixed {
        assert!(rhs.0 != 0, "fixed-point division by zero");
        Fixed(((self.0 as i64 * F as i64) / rhs.0 as i64) as i32)
    }
}
