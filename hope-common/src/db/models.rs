//! Shared value types persisted as TEXT columns
//!
//! Each enum round-trips through `as_str()` / `FromStr` so repository code can
//! bind and read plain strings.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Internal(format!(
                        "Invalid {} value in database: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Import-merge lifecycle of entities and satellites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    Pending,
    Merged,
    Removed,
}

text_enum!(MergeStatus {
    Pending => "PENDING",
    Merged => "MERGED",
    Removed => "REMOVED",
});

/// Which slice of the store a repository read sees.
///
/// Soft-removed rows are never visible through any scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeScope {
    /// Only rows that passed the import merge
    Merged,
    /// Only rows still waiting for the import merge
    Pending,
    /// Pending and merged rows
    Any,
}

impl MergeScope {
    /// SQL predicate over a table's `rdi_merge_status` column
    pub fn predicate(&self, column: &str) -> String {
        match self {
            MergeScope::Merged => format!("{} = 'MERGED'", column),
            MergeScope::Pending => format!("{} = 'PENDING'", column),
            MergeScope::Any => format!("{} IN ('PENDING', 'MERGED')", column),
        }
    }
}

/// Deduplication state of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Valid,
    NeedInvestigation,
    Invalid,
}

text_enum!(DocumentStatus {
    Pending => "PENDING",
    Valid => "VALID",
    NeedInvestigation => "NEED_INVESTIGATION",
    Invalid => "INVALID",
});

/// Collector role row kinds. HEAD is not a row: it lives on the household.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectorRole {
    Primary,
    Alternate,
}

text_enum!(CollectorRole {
    Primary => "PRIMARY",
    Alternate => "ALTERNATE",
});

impl CollectorRole {
    pub fn opposite(&self) -> Self {
        match self {
            CollectorRole::Primary => CollectorRole::Alternate,
            CollectorRole::Alternate => CollectorRole::Primary,
        }
    }
}

/// Any role that can be reassigned away from an individual
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HouseholdRole {
    Head,
    Primary,
    Alternate,
}

text_enum!(HouseholdRole {
    Head => "HEAD",
    Primary => "PRIMARY",
    Alternate => "ALTERNATE",
});

impl From<CollectorRole> for HouseholdRole {
    fn from(role: CollectorRole) -> Self {
        match role {
            CollectorRole::Primary => HouseholdRole::Primary,
            CollectorRole::Alternate => HouseholdRole::Alternate,
        }
    }
}

/// Relationship label for the head of household
pub const RELATIONSHIP_HEAD: &str = "HEAD";

/// Relationship label when the relation to the head is not known
pub const RELATIONSHIP_UNKNOWN: &str = "UNKNOWN";

/// Kind of entity a collection groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Household,
    Individual,
}

text_enum!(EntityKind {
    Household => "HOUSEHOLD",
    Individual => "INDIVIDUAL",
});

impl EntityKind {
    /// Backing table name
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Household => "households",
            EntityKind::Individual => "individuals",
        }
    }
}

/// Grievance ticket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    Closed,
}

text_enum!(TicketStatus {
    Open => "OPEN",
    Closed => "CLOSED",
});

/// Operator decision for one individual of an adjudication ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjudicationDecision {
    Distinct,
    Duplicate,
}

text_enum!(AdjudicationDecision {
    Distinct => "DISTINCT",
    Duplicate => "DUPLICATE",
});

/// Registration import lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Imported,
    Merging,
    Merged,
    MergeError,
}

text_enum!(ImportStatus {
    Imported => "IMPORTED",
    Merging => "MERGING",
    Merged => "MERGED",
    MergeError => "MERGE_ERROR",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_round_trip() {
        assert_eq!(
            "NEED_INVESTIGATION".parse::<DocumentStatus>().unwrap(),
            DocumentStatus::NeedInvestigation
        );
        assert_eq!(DocumentStatus::NeedInvestigation.as_str(), "NEED_INVESTIGATION");
        assert_eq!(ImportStatus::MergeError.to_string(), "MERGE_ERROR");
    }

    #[test]
    fn test_unknown_value_rejected() {
        assert!("SOMETIMES".parse::<MergeStatus>().is_err());
    }

    #[test]
    fn test_scope_predicate() {
        assert_eq!(
            MergeScope::Merged.predicate("h.rdi_merge_status"),
            "h.rdi_merge_status = 'MERGED'"
        );
        assert_eq!(
            MergeScope::Any.predicate("rdi_merge_status"),
            "rdi_merge_status IN ('PENDING', 'MERGED')"
        );
    }

    #[test]
    fn test_collector_role_opposite() {
        assert_eq!(CollectorRole::Primary.opposite(), CollectorRole::Alternate);
        assert_eq!(HouseholdRole::from(CollectorRole::Alternate), HouseholdRole::Alternate);
    }
}
