use std::fmt;

use serde::{Deserialize, Serialize};

/// Human decision matrix level: how much human involvement an action needs.
///
/// Levels are totally ordered; the engine runs at one ceiling level and any
/// action that requires a stricter level is gated out. The gate itself is a
/// pure comparison: callers are responsible for emitting
/// `autonomy:approval:required` when a check fails.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum HdmLevel {
    /// Purely informational; no human involvement.
    Informational = 0,
    /// Routine automation.
    Routine = 1,
    /// Elevated scrutiny; the default ceiling.
    Elevated = 2,
    /// Sensitive changes needing explicit sign-off.
    Sensitive = 3,
    /// Critical actions; always human-driven.
    Critical = 4,
}

impl HdmLevel {
    /// Every level, lowest first.
    pub const ALL: [Self; 5] = [
        Self::Informational,
        Self::Routine,
        Self::Elevated,
        Self::Sensitive,
        Self::Critical,
    ];

    /// Numeric index 0..=4.
    #[must_use]
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Level for a numeric index, when in range.
    #[must_use]
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Informational),
            1 => Some(Self::Routine),
            2 => Some(Self::Elevated),
            3 => Some(Self::Sensitive),
            4 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Fixed display name.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Informational => "informational",
            Self::Routine => "routine",
            Self::Elevated => "elevated",
            Self::Sensitive => "sensitive",
            Self::Critical => "critical",
        }
    }

    /// Returns true when an action at `required` may run under this ceiling.
    #[must_use]
    pub fn permits(self, required: Self) -> bool {
        required <= self
    }
}

impl Default for HdmLevel {
    fn default() -> Self {
        Self::Elevated
    }
}

impl fmt::Display for HdmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl TryFrom<u8> for HdmLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_index(value).ok_or_else(|| format!("approval level out of range: {value}"))
    }
}

impl From<HdmLevel> for u8 {
    fn from(level: HdmLevel) -> Self {
        level.index()
    }
}
