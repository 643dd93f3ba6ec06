use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The closed set of change classes a session can subscribe to.
///
/// On the wire an event class is its small integer index. Names are also
/// accepted when decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventClass {
    Value = 0,
    ChildAdded = 1,
    ChildChanged = 2,
    ChildMoved = 3,
    ChildRemoved = 4,
}

impl EventClass {
    pub const COUNT: usize = 5;

    pub const ALL: [EventClass; Self::COUNT] = [
        EventClass::Value,
        EventClass::ChildAdded,
        EventClass::ChildChanged,
        EventClass::ChildMoved,
        EventClass::ChildRemoved,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::ChildAdded => "child_added",
            Self::ChildChanged => "child_changed",
            Self::ChildMoved => "child_moved",
            Self::ChildRemoved => "child_removed",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .or_else(|| s.parse::<u64>().ok().and_then(Self::from_index))
            .ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

impl Serialize for EventClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for EventClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EventClassVisitor;

        impl Visitor<'_> for EventClassVisitor {
            type Value = EventClass;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an event type index 0..=4 or its name")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<EventClass, E> {
                EventClass::from_index(v)
                    .ok_or_else(|| E::custom(format!("unknown event type {v}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<EventClass, E> {
                u64::try_from(v)
                    .ok()
                    .and_then(EventClass::from_index)
                    .ok_or_else(|| E::custom(format!("unknown event type {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<EventClass, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(EventClassVisitor)
    }
}
