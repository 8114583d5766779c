//! Wire vocabulary shared by the realtime change stream server and its subscribers.
//!
//! Every `data:` frame on the stream carries one JSON object. The first frame
//! is the handshake `{"type":"connected","clientId":"..."}`; every later frame
//! is a serialized [`RealtimeEvent`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Value of the `type` field on the handshake frame.
pub const CONNECTED_TYPE: &str = "connected";

/// Business resource category used as the unit of cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    Property,
    Task,
    Booking,
    Finance,
    Service,
    ServiceBooking,
    Staff,
    Utility,
    Document,
    Owner,
    Settings,
    Automation,
    Inventory,
    Vendor,
    Investment,
    Review,
    Certification,
    SecurityDeposit,
    Sustainability,
    SharedCost,
    Chat,
    Dashboard,
}

impl ResourceType {
    pub const ALL: [ResourceType; 22] = [
        ResourceType::Property,
        ResourceType::Task,
        ResourceType::Booking,
        ResourceType::Finance,
        ResourceType::Service,
        ResourceType::ServiceBooking,
        ResourceType::Staff,
        ResourceType::Utility,
        ResourceType::Document,
        ResourceType::Owner,
        ResourceType::Settings,
        ResourceType::Automation,
        ResourceType::Inventory,
        ResourceType::Vendor,
        ResourceType::Investment,
        ResourceType::Review,
        ResourceType::Certification,
        ResourceType::SecurityDeposit,
        ResourceType::Sustainability,
        ResourceType::SharedCost,
        ResourceType::Chat,
        ResourceType::Dashboard,
    ];

    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Property => "property",
            ResourceType::Task => "task",
            ResourceType::Booking => "booking",
            ResourceType::Finance => "finance",
            ResourceType::Service => "service",
            ResourceType::ServiceBooking => "serviceBooking",
            ResourceType::Staff => "staff",
            ResourceType::Utility => "utility",
            ResourceType::Document => "document",
            ResourceType::Owner => "owner",
            ResourceType::Settings => "settings",
            ResourceType::Automation => "automation",
            ResourceType::Inventory => "inventory",
            ResourceType::Vendor => "vendor",
            ResourceType::Investment => "investment",
            ResourceType::Review => "review",
            ResourceType::Certification => "certification",
            ResourceType::SecurityDeposit => "securityDeposit",
            ResourceType::Sustainability => "sustainability",
            ResourceType::SharedCost => "sharedCost",
            ResourceType::Chat => "chat",
            ResourceType::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == value)
            .ok_or_else(|| ParseError::UnknownResource(value.to_string()))
    }
}

/// Kind of mutation that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeAction {
    Create,
    Update,
    Delete,
    Bulk,
}

impl RealtimeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeAction::Create => "create",
            RealtimeAction::Update => "update",
            RealtimeAction::Delete => "delete",
            RealtimeAction::Bulk => "bulk",
        }
    }
}

impl fmt::Display for RealtimeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of the changed record; numeric ids and string ids both occur.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Number(i64),
    Text(String),
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Number(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Text(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::Text(value)
    }
}

/// A change fact before the bus stamps it with a delivery timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub resource: ResourceType,
    pub action: RealtimeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

impl ChangeEvent {
    pub fn new(resource: ResourceType, action: RealtimeAction) -> Self {
        Self {
            resource,
            action,
            entity_id: None,
            organization_id: None,
            payload: None,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<EntityId>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_organization(mut self, organization_id: i64) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach the delivery timestamp (epoch milliseconds).
    pub fn stamp(self, timestamp: i64) -> RealtimeEvent {
        RealtimeEvent {
            resource: self.resource,
            action: self.action,
            entity_id: self.entity_id,
            organization_id: self.organization_id,
            payload: self.payload,
            timestamp,
        }
    }
}

/// A change event as delivered on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub resource: ResourceType,
    pub action: RealtimeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    pub timestamp: i64,
}

/// Handshake frame sent once per subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: String,
}

impl ConnectedFrame {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            kind: CONNECTED_TYPE.to_string(),
            client_id: client_id.into(),
        }
    }
}

/// Classified payload of one inbound `data:` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Connected { client_id: String },
    Event(RealtimeEvent),
}

impl StreamMessage {
    pub fn parse(data: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(data)?;
        if value.get("type").and_then(Value::as_str) == Some(CONNECTED_TYPE) {
            let frame: ConnectedFrame = serde_json::from_value(value)?;
            return Ok(StreamMessage::Connected {
                client_id: frame.client_id,
            });
        }
        Ok(StreamMessage::Event(serde_json::from_value(value)?))
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown resource type `{0}`")]
    UnknownResource(String),
}
