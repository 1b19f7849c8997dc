use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generates a string-backed identifier newtype.
///
/// Fresh ids are UUIDv7 so rows sort by creation time in logs and in SQLite.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Primary key of a persisted schedule definition.
    ScheduleId
);

string_id!(
    /// Primary key of one execution attempt.
    ExecutionId
);

string_id!(
    /// Identity of one engine process; used as the lease holder.
    InstanceId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_unique() {
        let a = ScheduleId::new();
        let b = ScheduleId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ExecutionId::from("exec-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""exec-1""#);
        let back: ExecutionId = serde_json::from_str(r#""exec-1""#).unwrap();
        assert_eq!(back, id);
    }
}
