//! Identifier newtypes

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generate a fresh locally-assigned identifier (UUID v7, time-sortable).
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Get the string representation of this ID
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is blank.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Survey identifier assigned by the remote store.
    SurveyId
);
string_id!(
    /// Job identifier, unique within a survey.
    JobId
);
string_id!(
    /// Task identifier, unique within a job.
    TaskId
);
string_id!(
    /// Task option identifier, unique within a task.
    OptionId
);
string_id!(
    /// Location of interest identifier.
    LoiId
);
string_id!(
    /// Submission identifier.
    SubmissionId
);
string_id!(
    /// Authenticated user identifier.
    UserId
);

/// Locally-assigned monotonic mutation identifier (the queue row id).
///
/// Never reused, even after the row is purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(i64);

impl MutationId {
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_sortable() {
        let first = LoiId::generate();
        let second = LoiId::generate();
        assert_ne!(first, second);
        assert!(!first.is_blank());
    }

    #[test]
    fn blank_ids_are_detected() {
        assert!(SurveyId::from("  ").is_blank());
        assert!(!SurveyId::from("s1").is_blank());
    }

    #[test]
    fn mutation_ids_order_numerically() {
        assert!(MutationId::new(2) < MutationId::new(10));
        assert_eq!(MutationId::new(7).to_string(), "7");
    }
}
