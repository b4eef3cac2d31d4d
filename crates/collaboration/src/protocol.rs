/// Wire protocol shared with the planner UI
///
/// Every message is `{ type, payload, timestamp, author, messageId }`.
/// Operation-bearing messages carry the operation flattened into the
/// payload; `encode` and `decode` map between the two shapes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use strategy::{EntityId, EntityPatch, EntityRecord, TargetKind};

use crate::{
    CollaborationError, MoveIndices, Operation, OperationData, OperationId, OperationKind, PeerId,
    Result, VectorClock,
};

/// Payload keys that describe the operation rather than the entity
const RESERVED_KEYS: [&str; 7] = [
    "targetId",
    "targetKind",
    "kind",
    "operationId",
    "vectorClock",
    "dependencies",
    "derivedFrom",
];

/// Message `type` values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    StrategyUpdate,
    TaskCreate,
    TaskUpdate,
    TaskDelete,
    UserJoined,
    UserLeft,
    /// Anything this client does not interpret
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::StrategyUpdate => "strategy_update",
            MessageType::TaskCreate => "task_create",
            MessageType::TaskUpdate => "task_update",
            MessageType::TaskDelete => "task_delete",
            MessageType::UserJoined => "user_joined",
            MessageType::UserLeft => "user_left",
            MessageType::Other(other) => other,
        }
    }

    pub fn is_operation(&self) -> bool {
        matches!(
            self,
            MessageType::StrategyUpdate
                | MessageType::TaskCreate
                | MessageType::TaskUpdate
                | MessageType::TaskDelete
        )
    }

    /// Message type that carries `operation`
    pub fn for_operation(operation: &Operation) -> Self {
        match (operation.target_kind, operation.kind()) {
            (TargetKind::Task, OperationKind::Create) => MessageType::TaskCreate,
            (TargetKind::Task, OperationKind::Delete) => MessageType::TaskDelete,
            (TargetKind::Task, _) => MessageType::TaskUpdate,
            _ => MessageType::StrategyUpdate,
        }
    }

    fn implied_target_kind(&self) -> Option<TargetKind> {
        match self {
            MessageType::TaskCreate | MessageType::TaskUpdate | MessageType::TaskDelete => {
                Some(TargetKind::Task)
            }
            MessageType::StrategyUpdate => Some(TargetKind::Strategy),
            _ => None,
        }
    }

    fn implied_kind(&self) -> Option<OperationKind> {
        match self {
            MessageType::TaskCreate => Some(OperationKind::Create),
            MessageType::TaskDelete => Some(OperationKind::Delete),
            MessageType::TaskUpdate | MessageType::StrategyUpdate => Some(OperationKind::Update),
            _ => None,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "strategy_update" => MessageType::StrategyUpdate,
            "task_create" => MessageType::TaskCreate,
            "task_update" => MessageType::TaskUpdate,
            "task_delete" => MessageType::TaskDelete,
            "user_joined" => MessageType::UserJoined,
            "user_left" => MessageType::UserLeft,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message envelope exchanged over the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,

    pub payload: Value,

    /// ISO-8601 with millisecond precision, always UTC (`...Z`)
    #[serde(with = "wire_timestamp")]
    pub timestamp: DateTime<Utc>,

    pub author: PeerId,

    #[serde(rename = "messageId")]
    pub message_id: String,
}

impl WireMessage {
    pub fn new(message_type: MessageType, payload: Value, author: PeerId, timestamp: DateTime<Utc>) -> Self {
        Self {
            message_type,
            payload,
            timestamp,
            author,
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Presence announcement for `user_joined` / `user_left`
    pub fn presence(message_type: MessageType, author: PeerId, timestamp: DateTime<Utc>) -> Self {
        let payload = json!({ "peerId": author.as_str() });
        Self::new(message_type, payload, author, timestamp)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CollaborationError::MalformedMessage(e.to_string()))
    }
}

/// Flatten an operation into a wire message
pub fn encode(operation: &Operation) -> Result<WireMessage> {
    let mut payload = match &operation.data {
        OperationData::Create(record) => record.to_fields()?,
        OperationData::Update(patch) => patch.to_fields()?,
        OperationData::Move(indices) => {
            let mut fields = Map::new();
            fields.insert("fromIndex".into(), json!(indices.from_index));
            fields.insert("toIndex".into(), json!(indices.to_index));
            fields
        }
        OperationData::Delete => Map::new(),
    };

    payload.insert("targetId".into(), json!(operation.target_id));
    payload.insert("targetKind".into(), json!(operation.target_kind));
    payload.insert("kind".into(), json!(operation.kind()));
    payload.insert("operationId".into(), json!(operation.id));
    payload.insert("vectorClock".into(), serde_json::to_value(&operation.vector_clock)?);
    if !operation.dependencies.is_empty() {
        payload.insert("dependencies".into(), json!(operation.dependencies));
    }
    if let Some(origin) = &operation.derived_from {
        payload.insert("derivedFrom".into(), json!(origin));
    }

    Ok(WireMessage::new(
        MessageType::for_operation(operation),
        Value::Object(payload),
        operation.author.clone(),
        operation.wall_clock,
    ))
}

/// Rebuild an operation from an operation-bearing wire message
pub fn decode(message: &WireMessage) -> Result<Operation> {
    if !message.message_type.is_operation() {
        return Err(malformed(format!(
            "{} does not carry an operation",
            message.message_type
        )));
    }
    let Value::Object(payload) = &message.payload else {
        return Err(malformed("payload is not an object"));
    };

    let target_kind = match payload.get("targetKind") {
        Some(value) => value
            .as_str()
            .and_then(TargetKind::parse)
            .ok_or_else(|| malformed(format!("unknown targetKind {}", value)))?,
        None => message
            .message_type
            .implied_target_kind()
            .ok_or_else(|| malformed("missing targetKind"))?,
    };
    let kind = match payload.get("kind") {
        Some(value) => value
            .as_str()
            .and_then(OperationKind::parse)
            .ok_or_else(|| malformed(format!("unknown kind {}", value)))?,
        None => message
            .message_type
            .implied_kind()
            .ok_or_else(|| malformed("missing kind"))?,
    };

    let target_id = EntityId::from(required_str(payload, "targetId")?);
    let id = OperationId::from(required_str(payload, "operationId")?);

    let vector_clock: VectorClock = match payload.get("vectorClock") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| malformed(format!("bad vectorClock: {}", e)))?,
        None => VectorClock::new(),
    };
    let dependencies: Vec<OperationId> = match payload.get("dependencies") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| malformed(format!("bad dependencies: {}", e)))?,
        None => Vec::new(),
    };

    let mut fields: Map<String, Value> = payload
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let data = match kind {
        OperationKind::Create => {
            fields
                .entry("id")
                .or_insert_with(|| json!(target_id.as_str()));
            let record = EntityRecord::from_fields(target_kind, Value::Object(fields))
                .map_err(|e| malformed(format!("bad {} record: {}", target_kind, e)))?;
            OperationData::Create(record)
        }
        OperationKind::Update => {
            let patch = EntityPatch::from_fields(target_kind, Value::Object(fields))
                .map_err(|e| malformed(format!("bad {} patch: {}", target_kind, e)))?;
            OperationData::Update(patch)
        }
        OperationKind::Move => OperationData::Move(MoveIndices::new(
            required_index(&fields, "fromIndex")?,
            required_index(&fields, "toIndex")?,
        )),
        OperationKind::Delete => OperationData::Delete,
    };

    let mut operation = Operation::new(
        id,
        target_kind,
        target_id,
        data,
        vector_clock,
        message.timestamp,
        message.author.clone(),
        dependencies,
    )
    .map_err(|e| malformed(e.to_string()))?;

    if let Some(origin) = payload.get("derivedFrom").and_then(Value::as_str) {
        operation.derived_from = Some(OperationId::from(origin));
    }

    Ok(operation)
}

fn malformed(reason: impl Into<String>) -> CollaborationError {
    CollaborationError::MalformedMessage(reason.into())
}

fn required_str<'a>(payload: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| malformed(format!("missing {}", key)))
}

fn required_index(fields: &Map<String, Value>, key: &str) -> Result<usize> {
    fields
        .get(key)
        .and_then(Value::as_u64)
        .map(|index| index as usize)
        .ok_or_else(|| malformed(format!("missing {}", key)))
}

mod wire_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use strategy::{Task, TaskPatch};

    fn at_millis(millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(millis)
    }

    fn operation(target_kind: TargetKind, target: &str, data: OperationData) -> Operation {
        let author = PeerId::from("ROOM-aa11bb22");
        let clock: VectorClock = [(author.clone(), 3)].into_iter().collect();
        Operation::new(
            OperationId::from("ROOM-aa11bb22-3-deadbeef"),
            target_kind,
            EntityId::from(target),
            data,
            clock,
            at_millis(1_700_000_000_123),
            author,
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_envelope_shape() {
        let op = operation(
            TargetKind::Task,
            "t1",
            OperationData::Update(EntityPatch::Task(TaskPatch {
                priority: Some(3),
                ..Default::default()
            })),
        );
        let message = encode(&op).unwrap();
        let json: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "task_update");
        assert_eq!(json["timestamp"], "2023-11-14T22:13:20.123Z");
        assert_eq!(json["author"], "ROOM-aa11bb22");
        assert!(json["messageId"].is_string());
        assert_eq!(json["payload"]["priority"], 3);
        assert_eq!(json["payload"]["targetId"], "t1");
        assert_eq!(json["payload"]["vectorClock"]["ROOM-aa11bb22"], 3);
        assert!(json["payload"].get("dependencies").is_none());
    }

    #[test]
    fn test_message_type_per_operation() {
        let task = Task::new("Scout");
        let id = task.id.clone();
        let create = operation(TargetKind::Task, id.as_str(), OperationData::Create(EntityRecord::Task(task)));
        let delete = operation(TargetKind::Task, "t1", OperationData::Delete);
        let moved = operation(TargetKind::Task, "t1", OperationData::Move(MoveIndices::new(0, 2)));
        let player = operation(TargetKind::Player, "p1", OperationData::Delete);

        assert_eq!(MessageType::for_operation(&create), MessageType::TaskCreate);
        assert_eq!(MessageType::for_operation(&delete), MessageType::TaskDelete);
        assert_eq!(MessageType::for_operation(&moved), MessageType::TaskUpdate);
        assert_eq!(MessageType::for_operation(&player), MessageType::StrategyUpdate);
    }

    #[test]
    fn test_decode_restores_operation() {
        let mut task = Task::new("Forge");
        task.category = "Armor".into();
        let id = task.id.clone();
        let mut op = operation(TargetKind::Task, id.as_str(), OperationData::Create(EntityRecord::Task(task)));
        op.dependencies = vec![OperationId::from("ROOM-aa11bb22-2-cafebabe")];

        let message = WireMessage::from_json(&encode(&op).unwrap().to_json().unwrap()).unwrap();
        assert_eq!(decode(&message).unwrap(), op);

        let moved = operation(TargetKind::Milestone, "m1", OperationData::Move(MoveIndices::new(4, 1)));
        assert_eq!(decode(&encode(&moved).unwrap()).unwrap(), moved);
    }

    #[test]
    fn test_decode_infers_kind_from_type() {
        let message = WireMessage {
            message_type: MessageType::TaskUpdate,
            payload: json!({ "targetId": "t9", "operationId": "x-1-00000000", "category": "Armor" }),
            timestamp: at_millis(0),
            author: PeerId::from("x"),
            message_id: "m-1".into(),
        };

        let op = decode(&message).unwrap();
        assert_eq!(op.target_kind, TargetKind::Task);
        assert_eq!(op.kind(), OperationKind::Update);
        assert!(op.vector_clock.is_empty());
        assert_eq!(
            op.data,
            OperationData::Update(EntityPatch::Task(TaskPatch {
                category: Some("Armor".into()),
                ..Default::default()
            }))
        );
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let base = WireMessage {
            message_type: MessageType::TaskUpdate,
            payload: json!({ "operationId": "x-1-00000000", "priority": 2 }),
            timestamp: at_millis(0),
            author: PeerId::from("x"),
            message_id: "m-1".into(),
        };
        assert!(matches!(decode(&base), Err(CollaborationError::MalformedMessage(_))));

        let mut no_op_id = base.clone();
        no_op_id.payload = json!({ "targetId": "t1" });
        assert!(matches!(decode(&no_op_id), Err(CollaborationError::MalformedMessage(_))));

        let mut not_object = base.clone();
        not_object.payload = json!([1, 2]);
        assert!(matches!(decode(&not_object), Err(CollaborationError::MalformedMessage(_))));

        let mut presence = base;
        presence.message_type = MessageType::UserJoined;
        assert!(matches!(decode(&presence), Err(CollaborationError::MalformedMessage(_))));
    }

    #[test]
    fn test_decode_rejects_mistyped_payload() {
        let message = WireMessage {
            message_type: MessageType::TaskUpdate,
            payload: json!({ "targetId": "t1", "operationId": "x-1-0", "priority": "high" }),
            timestamp: at_millis(0),
            author: PeerId::from("x"),
            message_id: "m-2".into(),
        };
        assert!(matches!(decode(&message), Err(CollaborationError::MalformedMessage(_))));
    }

    #[test]
    fn test_unknown_type_preserved() {
        let raw = r#"{"type":"cursor_moved","payload":{},"timestamp":"2024-01-01T00:00:00.000Z","author":"p","messageId":"m"}"#;
        let message = WireMessage::from_json(raw).unwrap();
        assert_eq!(message.message_type, MessageType::Other("cursor_moved".into()));
        assert_eq!(message.to_json().unwrap(), raw);
    }
}
