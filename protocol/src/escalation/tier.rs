//! Model tier ladder.

use serde::{Deserialize, Serialize};

/// Model capability levels, cheapest first.
///
/// `Ord` follows the ladder: `Worker < Fallback < Architect`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Fast, cheap generation model.
    #[default]
    Worker,
    /// Stronger model for repeated failures.
    Fallback,
    /// Most capable (and expensive) model; last automatic rung.
    Architect,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [Self::Worker, Self::Fallback, Self::Architect];

    /// The next rung up, `None` at the top of the ladder.
    pub fn next(self) -> Option<ModelTier> {
        match self {
            Self::Worker => Some(Self::Fallback),
            Self::Fallback => Some(Self::Architect),
            Self::Architect => None,
        }
    }

    pub fn is_top(self) -> bool {
        self == Self::Architect
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Fallback => "fallback",
            Self::Architect => "architect",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown model tier: {s}"))
    }
}
