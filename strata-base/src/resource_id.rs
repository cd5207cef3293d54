use std::fmt;
use std::fmt::{Debug, Formatter};

use serde::de::Visitor;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Stable, path-independent name of a persisted resource instance. Never
/// reused for a different resource within a manifest's lifetime.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct ResourceId(pub u128);

impl ResourceId {
    pub const fn null() -> Self {
        ResourceId(0)
    }

    /// Mints a fresh random identity, used when a path has no manifest entry.
    pub fn generate() -> Self {
        ResourceId(Uuid::new_v4().as_u128())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        ResourceId(uuid.as_u128())
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_u128(self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn from_u128(u: u128) -> Self {
        Self(u)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl Debug for ResourceId {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("ResourceId")
            .field(&Uuid::from_u128(self.0))
            .finish()
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&Uuid::from_u128(self.0).to_string())
        } else {
            Uuid::from_u128(self.0).serialize(serializer)
        }
    }
}

struct ResourceIdVisitor;

impl<'a> Visitor<'a> for ResourceIdVisitor {
    type Value = ResourceId;

    fn expecting(
        &self,
        fmt: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(fmt, "a UUID-formatted string")
    }

    fn visit_str<E: de::Error>(
        self,
        s: &str,
    ) -> Result<Self::Value, E> {
        Uuid::parse_str(s)
            .map(|id| ResourceId(id.as_u128()))
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(s), &self))
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_string(ResourceIdVisitor)
        } else {
            Ok(ResourceId(Uuid::deserialize(deserializer)?.as_u128()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generate_is_unique() {
        let a = ResourceId::generate();
        let b = ResourceId::generate();
        assert_ne!(a, b);
        assert!(!a.is_null());
    }

    #[test]
    fn uuid_round_trip() {
        let id = ResourceId::generate();
        assert_eq!(id, ResourceId::from_uuid(id.as_uuid()));
        assert_eq!(id, ResourceId::from_u128(id.as_u128()));
    }

    #[test]
    fn human_readable_serde_uses_uuid_string() {
        let id = ResourceId::from_u128(0xdead_beef);
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains('-'));
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
