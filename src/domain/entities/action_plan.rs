use super::directive::Side;
use serde::Serialize;
use std::fmt;

/// One exchange operation in a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionStep {
    Close,
    Open(Side),
}

impl fmt::Display for ActionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStep::Close => write!(f, "CLOSE"),
            ActionStep::Open(side) => write!(f, "OPEN({})", side),
        }
    }
}

/// Ordered exchange operations needed to move a symbol to its desired side.
/// An empty plan means NO_ACTION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPlan {
    pub symbol: String,
    pub steps: Vec<ActionStep>,
}

impl ActionPlan {
    pub fn no_action(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            steps: Vec::new(),
        }
    }

    pub fn is_no_action(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_reversal(&self) -> bool {
        matches!(
            self.steps.as_slice(),
            [ActionStep::Close, ActionStep::Open(_)]
        )
    }

    /// Side the plan opens, if any
    pub fn target_side(&self) -> Option<Side> {
        self.steps.iter().find_map(|step| match step {
            ActionStep::Open(side) => Some(*side),
            ActionStep::Close => None,
        })
    }

    /// Label used in responses, e.g. `CLOSE+OPEN(SHORT)`
    pub fn label(&self) -> String {
        if self.steps.is_empty() {
            return "NO_ACTION".to_string();
        }
        self.steps
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("+")
    }
}
