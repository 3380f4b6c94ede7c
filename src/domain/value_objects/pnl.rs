use crate::domain::entities::directive::Side;
use crate::domain::errors::ValidationError;

/// Realized profit or loss as a percentage of entry price, sign-adjusted for side.
///
/// Negative values are losses. The value is always finite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct PnlPercentage(f64);

impl PnlPercentage {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Ok(PnlPercentage(value))
    }

    /// LONG: `(exit - entry) / entry * 100`, SHORT: `(entry - exit) / entry * 100`.
    ///
    /// # Errors
    /// Fails for a FLAT side, a non-positive entry price, or a non-finite result.
    pub fn compute(side: Side, entry_price: f64, exit_price: f64) -> Result<Self, ValidationError> {
        if !(entry_price > 0.0) {
            return Err(ValidationError::invalid("entry_price", "must be positive"));
        }
        let raw = match side {
            Side::Long => (exit_price - entry_price) / entry_price * 100.0,
            Side::Short => (entry_price - exit_price) / entry_price * 100.0,
            Side::Flat => {
                return Err(ValidationError::invalid("side", "flat positions carry no PnL"))
            }
        };
        PnlPercentage::new(raw)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_profit(&self) -> bool {
        self.0 > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.0 < 0.0
    }
}

impl std::fmt::Display for PnlPercentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 0.0 {
            write!(f, "+{:.2}%", self.0)
        } else {
            write!(f, "-{:.2}%", self.0.abs())
        }
    }
}
