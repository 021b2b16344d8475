use std::{collections::BTreeMap, fmt};

use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};

/// Quantized spatial signature of a detection, rendered `"{x}_{y}_{area}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityId {
    pub x: i64,
    pub y: i64,
    pub area: i64,
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.x, self.y, self.area)
    }
}

impl Serialize for IdentityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Hypothesis that a person is currently in view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedIdentity {
    pub id: IdentityId,
    pub last_position: (f32, f32),
    pub last_area: f32,
    pub last_seen_at: NaiveDateTime,
}

impl TrackedIdentity {
    pub fn new(id: IdentityId, position: (f32, f32), area: f32, seen_at: NaiveDateTime) -> Self {
        Self {
            id,
            last_position: position,
            last_area: area,
            last_seen_at: seen_at,
        }
    }

    pub fn refresh(&mut self, position: (f32, f32), area: f32, seen_at: NaiveDateTime) {
        self.last_position = position;
        self.last_area = area;
        self.last_seen_at = seen_at;
    }
}

/// People currently in frame. Ordered so matching iterates deterministically.
pub type ActiveIdentities = BTreeMap<IdentityId, TrackedIdentity>;
