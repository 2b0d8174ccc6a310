//! Identifiers for items, stored content objects and bus events.
//!
//! All three are UUIDs underneath; the newtypes keep an `ObjectId` from
//! being looked up as a `DeltaFileId`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declares `Copy` UUID newtypes that serialize, print and parse as the
/// bare UUID. `Default` is a fresh random id.
macro_rules! typed_id {
    ($($(#[doc = $doc:expr])* $name:ident),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                /// A random v4 id.
                #[must_use]
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                #[must_use]
                pub fn as_uuid(&self) -> &Uuid {
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
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = uuid::Error;

                fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                    Uuid::parse_str(s).map(Self)
                }
            }

            impl From<Uuid> for $name {
                fn from(uuid: Uuid) -> Self {
                    Self(uuid)
                }
            }

            impl From<$name> for Uuid {
                fn from(id: $name) -> Self {
                    id.0
                }
            }
        )+
    };
}

typed_id! {
    /// Unique identifier for an ingested item (a DeltaFile).
    DeltaFileId,
    /// Unique identifier for a blob in the content store.
    ObjectId,
    /// Unique identifier for one lifecycle event on the event bus.
    EventId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = DeltaFileId::new();
        let b = DeltaFileId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn roundtrip_uuid() {
        let uuid = Uuid::new_v4();
        let id = ObjectId::from(uuid);
        let back: Uuid = id.into();
        assert_eq!(uuid, back);
    }

    #[test]
    fn display_and_from_str() {
        let id = DeltaFileId::new();
        let parsed: DeltaFileId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serializes_as_bare_uuid() {
        let id = ObjectId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn ordered_set_usage() {
        use std::collections::BTreeSet;
        let mut set = BTreeSet::new();
        let id = DeltaFileId::new();
        set.insert(id);
        set.insert(id);
        assert_eq!(set.len(), 1);
    }
}
