//! Identifier types shared by every Floorcast crate.

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw numeric id.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Unique identifier for a worker on the roster.
    WorkerId,
    "W"
);

numeric_id!(
    /// Unique identifier for a warehouse zone.
    ZoneId,
    "Z"
);

numeric_id!(
    /// Unique identifier for an active task or a pick task.
    ///
    /// Active tasks and pick tasks live in separate id spaces; a zone only
    /// ever runs one kind, so the two never meet in the same pool.
    TaskId,
    "T"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefix() {
        assert_eq!(WorkerId(7).to_string(), "W7");
        assert_eq!(ZoneId(2).to_string(), "Z2");
        assert_eq!(TaskId(31).to_string(), "T31");
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&ZoneId(4)).unwrap();
        assert_eq!(json, "4");
        let back: WorkerId = serde_json::from_str("12").unwrap();
        assert_eq!(back, WorkerId(12));
    }
}
