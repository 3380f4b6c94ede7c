//! Position state resolution: `(current side, desired side) -> ActionPlan`.
//!
//! Pure and deterministic; the current side comes from the ledger, never from
//! the exchange.

use crate::domain::entities::action_plan::{ActionPlan, ActionStep};
use crate::domain::entities::directive::Side;

pub fn resolve(symbol: &str, current: Side, desired: Side) -> ActionPlan {
    let steps = match (current, desired) {
        (c, d) if c == d => Vec::new(),
        (Side::Flat, d) => vec![ActionStep::Open(d)],
        (_, Side::Flat) => vec![ActionStep::Close],
        // LONG -> SHORT or SHORT -> LONG: always two legs
        (_, d) => vec![ActionStep::Close, ActionStep::Open(d)],
    };
    ActionPlan {
        symbol: symbol.to_string(),
        steps,
    }
}
