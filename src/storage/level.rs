//! Persistence levels (retention classes)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Retention class of a block.
///
/// Ordered by durability: `Transient < Static < Critical`. A clear at level
/// `L` removes every block whose level is `<= L`, so clearing `Static` also
/// clears `Transient` and never touches `Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceLevel {
    /// Dropped every time the store is opened
    Transient,
    /// Dropped only by an explicit operator clear
    Static,
    /// Dropped only by a destructive reset
    Critical,
}

impl PersistenceLevel {
    /// Every level, least durable first
    pub const ALL: [PersistenceLevel; 3] = [
        PersistenceLevel::Transient,
        PersistenceLevel::Static,
        PersistenceLevel::Critical,
    ];

    /// Durability rank as stored in the catalog
    pub fn rank(self) -> i64 {
        match self {
            PersistenceLevel::Transient => 0,
            PersistenceLevel::Static => 1,
            PersistenceLevel::Critical => 2,
        }
    }

    /// Inverse of [`rank`](Self::rank)
    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(PersistenceLevel::Transient),
            1 => Some(PersistenceLevel::Static),
            2 => Some(PersistenceLevel::Critical),
            _ => None,
        }
    }

    /// Whether a clear requested at `requested` destroys blocks of this level
    pub fn is_cleared_by(self, requested: PersistenceLevel) -> bool {
        self <= requested
    }

    /// Levels destroyed by a clear at this level
    pub fn cleared_levels(self) -> impl Iterator<Item = PersistenceLevel> {
        Self::ALL.into_iter().filter(move |l| l.is_cleared_by(self))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PersistenceLevel::Transient => "transient",
            PersistenceLevel::Static => "static",
            PersistenceLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for PersistenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersistenceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transient" => Ok(PersistenceLevel::Transient),
            "static" => Ok(PersistenceLevel::Static),
            "critical" => Ok(PersistenceLevel::Critical),
            other => Err(format!("unknown persistence level '{}'", other)),
        }
    }
}
