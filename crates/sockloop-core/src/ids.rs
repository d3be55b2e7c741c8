//! Branded ID newtypes.
//!
//! Each ID is a newtype over `String` so a session ID can never be passed
//! where a job ID is expected. Freshly generated IDs carry a short type
//! prefix followed by a UUID v7 (time-ordered), e.g. `sid_0190…`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used for freshly generated IDs.
            pub const PREFIX: &'static str = $prefix;

            /// Create a new random ID (prefixed UUID v7).
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
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
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of one connected client session.
    SessionId, "sid"
}

branded_id! {
    /// Identifier of one unit of work handed to the offload pool.
    JobId, "job"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_ids_carry_prefix() {
        assert!(SessionId::new().as_str().starts_with("sid_"));
        assert!(JobId::new().as_str().starts_with("job_"));
    }

    #[test]
    fn new_ids_are_unique() {
        let ids: HashSet<SessionId> = (0..500).map(|_| SessionId::new()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn from_str_roundtrip() {
        let id = SessionId::from("a");
        assert_eq!(id.as_str(), "a");
        assert_eq!(id.to_string(), "a");
        assert_eq!(String::from(id), "a");
    }

    #[test]
    fn serializes_transparently() {
        let id = SessionId::from("sid_x");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sid_x\"");
        let back: SessionId = serde_json::from_str("\"sid_x\"").unwrap();
        assert_eq!(back, id);
    }
}
