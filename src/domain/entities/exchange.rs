use crate::domain::errors::ValidationError;

/// Per-venue execution settings, owned by configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConfig {
    pub exchange_id: String,
    /// Percent of account equity committed per OPEN, in (0, 100]
    pub position_sizing_percentage: f64,
    pub is_active: bool,
}

impl ExchangeConfig {
    pub fn new(
        exchange_id: impl Into<String>,
        position_sizing_percentage: f64,
        is_active: bool,
    ) -> Result<Self, ValidationError> {
        let exchange_id = exchange_id.into();
        if exchange_id.trim().is_empty() {
            return Err(ValidationError::MissingField("exchange_id".to_string()));
        }
        if !position_sizing_percentage.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if position_sizing_percentage <= 0.0 || position_sizing_percentage > 100.0 {
            return Err(ValidationError::invalid(
                "position_sizing_percentage",
                format!("{} is outside (0, 100]", position_sizing_percentage),
            ));
        }
        Ok(Self {
            exchange_id,
            position_sizing_percentage,
            is_active,
        })
    }

    /// Notional for an OPEN given the current account equity
    pub fn notional_for(&self, equity: f64) -> f64 {
        self.position_sizing_percentage / 100.0 * equity
    }
}
