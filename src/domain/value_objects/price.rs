use crate::domain::errors::ValidationError;

/// A strictly positive, finite price
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::invalid("price", "must be positive"));
        }
        Ok(Price(value))
    }

    /// Parse a price token verbatim, tolerating thousands separators ("45,000.5")
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let cleaned: String = text.trim().chars().filter(|c| *c != ',').collect();
        let value = cleaned
            .parse::<f64>()
            .map_err(|_| ValidationError::invalid("price", format!("'{}' is not a number", text)))?;
        Price::new(value)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}
