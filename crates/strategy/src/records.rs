use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    EntityId, EntityPatch, MilestonePatch, PlayerPatch, StrategyError, StrategyPatch, TargetKind,
    TaskPatch,
};

/// A build order / game plan. Owns tasks, milestones and players.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub faction: Option<String>,
}

impl Strategy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            description: String::new(),
            faction: None,
        }
    }

    pub fn apply(&mut self, patch: &StrategyPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(faction) = &patch.faction {
            self.faction = faction.clone();
        }
    }
}

/// A bar on the Gantt chart: something to build or research over a time span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: EntityId,
    #[serde(default)]
    pub strategy_id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub priority: i32,
    /// Game time in seconds
    #[serde(default)]
    pub start_time: u32,
    /// Duration in seconds
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub player_id: Option<EntityId>,
    #[serde(default)]
    pub notes: String,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            strategy_id: None,
            name: name.into(),
            category: String::new(),
            priority: 0,
            start_time: 0,
            duration: 0,
            player_id: None,
            notes: String::new(),
        }
    }

    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(category) = &patch.category {
            self.category = category.clone();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(start_time) = patch.start_time {
            self.start_time = start_time;
        }
        if let Some(duration) = patch.duration {
            self.duration = duration;
        }
        if let Some(player_id) = &patch.player_id {
            self.player_id = player_id.clone();
        }
        if let Some(notes) = &patch.notes {
            self.notes = notes.clone();
        }
    }
}

/// A named point on the timeline, e.g. "first expansion".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: EntityId,
    #[serde(default)]
    pub strategy_id: Option<EntityId>,
    pub name: String,
    /// Game time in seconds
    #[serde(default)]
    pub time: u32,
    #[serde(default)]
    pub description: String,
}

impl Milestone {
    pub fn new(name: impl Into<String>, time: u32) -> Self {
        Self {
            id: EntityId::new(),
            strategy_id: None,
            name: name.into(),
            time,
            description: String::new(),
        }
    }

    pub fn apply(&mut self, patch: &MilestonePatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(time) = patch.time {
            self.time = time;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: EntityId,
    #[serde(default)]
    pub strategy_id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub faction: Option<String>,
}

impl Player {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            strategy_id: None,
            name: name.into(),
            color: String::new(),
            faction: None,
        }
    }

    pub fn apply(&mut self, patch: &PlayerPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(color) = &patch.color {
            self.color = color.clone();
        }
        if let Some(faction) = &patch.faction {
            self.faction = faction.clone();
        }
    }
}

/// A complete entity, as carried by a create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum EntityRecord {
    Strategy(Strategy),
    Task(Task),
    Milestone(Milestone),
    Player(Player),
}

impl EntityRecord {
    pub fn id(&self) -> &EntityId {
        match self {
            EntityRecord::Strategy(s) => &s.id,
            EntityRecord::Task(t) => &t.id,
            EntityRecord::Milestone(m) => &m.id,
            EntityRecord::Player(p) => &p.id,
        }
    }

    pub fn target_kind(&self) -> TargetKind {
        match self {
            EntityRecord::Strategy(_) => TargetKind::Strategy,
            EntityRecord::Task(_) => TargetKind::Task,
            EntityRecord::Milestone(_) => TargetKind::Milestone,
            EntityRecord::Player(_) => TargetKind::Player,
        }
    }

    /// Apply a patch of the same kind in place.
    pub fn apply(&mut self, patch: &EntityPatch) -> Result<(), StrategyError> {
        match (self, patch) {
            (EntityRecord::Strategy(s), EntityPatch::Strategy(p)) => s.apply(p),
            (EntityRecord::Task(t), EntityPatch::Task(p)) => t.apply(p),
            (EntityRecord::Milestone(m), EntityPatch::Milestone(p)) => m.apply(p),
            (EntityRecord::Player(pl), EntityPatch::Player(p)) => pl.apply(p),
            (record, patch) => {
                return Err(StrategyError::PatchMismatch {
                    expected: record.target_kind(),
                    found: patch.target_kind(),
                })
            }
        }
        Ok(())
    }

    /// The record's fields as a flat JSON object, without the kind tag.
    pub fn to_fields(&self) -> serde_json::Result<serde_json::Map<String, Value>> {
        let value = match self {
            EntityRecord::Strategy(s) => serde_json::to_value(s)?,
            EntityRecord::Task(t) => serde_json::to_value(t)?,
            EntityRecord::Milestone(m) => serde_json::to_value(m)?,
            EntityRecord::Player(p) => serde_json::to_value(p)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        }
    }

    /// Rebuild a record of `kind` from flat JSON fields.
    pub fn from_fields(kind: TargetKind, fields: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            TargetKind::Strategy => EntityRecord::Strategy(serde_json::from_value(fields)?),
            TargetKind::Task => EntityRecord::Task(serde_json::from_value(fields)?),
            TargetKind::Milestone => EntityRecord::Milestone(serde_json::from_value(fields)?),
            TargetKind::Player => EntityRecord::Player(serde_json::from_value(fields)?),
        })
    }
}
