/// Partial-field updates for each entity kind.
///
/// A `None` field means "not touched by this edit", which is what makes
/// field-level merging of concurrent updates possible. Fields the record
/// stores as optional are `Option<Option<T>>`: `Some(None)` clears them and
/// travels as an explicit `null`.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EntityId, StrategyError, TargetKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub faction: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub player_id: Option<Option<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestonePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    pub faction: Option<Option<String>>,
}

/// Keeps an explicit `null` apart from an absent key
mod nullable {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Pick the value for one field when two concurrent patches meet.
///
/// A field only one side touched is kept from that side. A field both
/// sides touched goes to the remote value only when the remote edit is
/// strictly newer.
fn pick<T: Clone>(local: &Option<T>, remote: &Option<T>, remote_newer: bool) -> Option<T> {
    match (local, remote) {
        (_, None) => local.clone(),
        (None, Some(r)) => Some(r.clone()),
        (Some(l), Some(r)) => {
            if remote_newer {
                Some(r.clone())
            } else {
                Some(l.clone())
            }
        }
    }
}

impl StrategyPatch {
    fn merge_concurrent(&self, remote: &Self, remote_newer: bool) -> Self {
        Self {
            name: pick(&self.name, &remote.name, remote_newer),
            description: pick(&self.description, &remote.description, remote_newer),
            faction: pick(&self.faction, &remote.faction, remote_newer),
        }
    }
}

impl TaskPatch {
    fn merge_concurrent(&self, remote: &Self, remote_newer: bool) -> Self {
        Self {
            name: pick(&self.name, &remote.name, remote_newer),
            category: pick(&self.category, &remote.category, remote_newer),
            priority: pick(&self.priority, &remote.priority, remote_newer),
            start_time: pick(&self.start_time, &remote.start_time, remote_newer),
            duration: pick(&self.duration, &remote.duration, remote_newer),
            player_id: pick(&self.player_id, &remote.player_id, remote_newer),
            notes: pick(&self.notes, &remote.notes, remote_newer),
        }
    }
}

impl MilestonePatch {
    fn merge_concurrent(&self, remote: &Self, remote_newer: bool) -> Self {
        Self {
            name: pick(&self.name, &remote.name, remote_newer),
            time: pick(&self.time, &remote.time, remote_newer),
            description: pick(&self.description, &remote.description, remote_newer),
        }
    }
}

impl PlayerPatch {
    fn merge_concurrent(&self, remote: &Self, remote_newer: bool) -> Self {
        Self {
            name: pick(&self.name, &remote.name, remote_newer),
            color: pick(&self.color, &remote.color, remote_newer),
            faction: pick(&self.faction, &remote.faction, remote_newer),
        }
    }
}

/// An update payload, one variant per entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum EntityPatch {
    Strategy(StrategyPatch),
    Task(TaskPatch),
    Milestone(MilestonePatch),
    Player(PlayerPatch),
}

impl EntityPatch {
    pub fn target_kind(&self) -> TargetKind {
        match self {
            EntityPatch::Strategy(_) => TargetKind::Strategy,
            EntityPatch::Task(_) => TargetKind::Task,
            EntityPatch::Milestone(_) => TargetKind::Milestone,
            EntityPatch::Player(_) => TargetKind::Player,
        }
    }

    /// Field-level merge of two concurrent updates to the same entity.
    ///
    /// `self` is the locally applied patch, `remote` the incoming one.
    pub fn merge_concurrent(
        &self,
        remote: &EntityPatch,
        remote_newer: bool,
    ) -> Result<EntityPatch, StrategyError> {
        Ok(match (self, remote) {
            (EntityPatch::Strategy(l), EntityPatch::Strategy(r)) => {
                EntityPatch::Strategy(l.merge_concurrent(r, remote_newer))
            }
            (EntityPatch::Task(l), EntityPatch::Task(r)) => {
                EntityPatch::Task(l.merge_concurrent(r, remote_newer))
            }
            (EntityPatch::Milestone(l), EntityPatch::Milestone(r)) => {
                EntityPatch::Milestone(l.merge_concurrent(r, remote_newer))
            }
            (EntityPatch::Player(l), EntityPatch::Player(r)) => {
                EntityPatch::Player(l.merge_concurrent(r, remote_newer))
            }
            (local, remote) => {
                return Err(StrategyError::PatchMismatch {
                    expected: local.target_kind(),
                    found: remote.target_kind(),
                })
            }
        })
    }

    /// The touched fields as a flat JSON object, without the kind tag.
    pub fn to_fields(&self) -> serde_json::Result<serde_json::Map<String, Value>> {
        let value = match self {
            EntityPatch::Strategy(p) => serde_json::to_value(p)?,
            EntityPatch::Task(p) => serde_json::to_value(p)?,
            EntityPatch::Milestone(p) => serde_json::to_value(p)?,
            EntityPatch::Player(p) => serde_json::to_value(p)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        }
    }

    /// Rebuild a patch of `kind` from flat JSON fields. Unknown keys are ignored.
    pub fn from_fields(kind: TargetKind, fields: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            TargetKind::Strategy => EntityPatch::Strategy(serde_json::from_value(fields)?),
            TargetKind::Task => EntityPatch::Task(serde_json::from_value(fields)?),
            TargetKind::Milestone => EntityPatch::Milestone(serde_json::from_value(fields)?),
            TargetKind::Player => EntityPatch::Player(serde_json::from_value(fields)?),
        })
    }
}
