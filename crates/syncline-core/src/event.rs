use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token value stored when a room's history has been fully paginated.
///
/// Never sent to the server; a request resolving to this token yields an
/// empty page without any network traffic.
pub const END_OF_HISTORY_TOKEN: &str = "END_OF_HISTORY";

/// Direction in which an event stream is traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Live ordering: apply `content`.
    Forwards,
    /// Un-applying while walking into history: apply `prev_content`.
    Backwards,
}

/// Event types the reducer and rule engine branch on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    RoomName,
    RoomTopic,
    RoomCreate,
    RoomJoinRules,
    RoomGuestAccess,
    RoomAliases,
    RoomCanonicalAlias,
    RoomHistoryVisibility,
    RoomAvatar,
    RoomMember,
    RoomPowerLevels,
    RoomThirdPartyInvite,
    RoomTombstone,
    RoomPinnedEvents,
    RoomEncryption,
    RoomRelatedGroups,
    RoomMessage,
    Presence,
    Typing,
    Redaction,
    Receipt,
    RoomTag,
    Other(String),
}

impl EventType {
    /// Wire identifier for this event type.
    pub fn as_wire(&self) -> &str {
        match self {
            Self::RoomName => "m.room.name",
            Self::RoomTopic => "m.room.topic",
            Self::RoomCreate => "m.room.create",
            Self::RoomJoinRules => "m.room.join_rules",
            Self::RoomGuestAccess => "m.room.guest_access",
            Self::RoomAliases => "m.room.aliases",
            Self::RoomCanonicalAlias => "m.room.canonical_alias",
            Self::RoomHistoryVisibility => "m.room.history_visibility",
            Self::RoomAvatar => "m.room.avatar",
            Self::RoomMember => "m.room.member",
            Self::RoomPowerLevels => "m.room.power_levels",
            Self::RoomThirdPartyInvite => "m.room.third_party_invite",
            Self::RoomTombstone => "m.room.tombstone",
            Self::RoomPinnedEvents => "m.room.pinned_events",
            Self::RoomEncryption => "m.room.encryption",
            Self::RoomRelatedGroups => "m.room.related_groups",
            Self::RoomMessage => "m.room.message",
            Self::Presence => "m.presence",
            Self::Typing => "m.typing",
            Self::Redaction => "m.room.redaction",
            Self::Receipt => "m.receipt",
            Self::RoomTag => "m.tag",
            Self::Other(value) => value,
        }
    }

    /// True for types that can never trigger a notification.
    pub fn is_bingable(&self) -> bool {
        !matches!(
            self,
            Self::Presence | Self::Typing | Self::Redaction | Self::Receipt | Self::RoomTag
        )
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "m.room.name" => Self::RoomName,
            "m.room.topic" => Self::RoomTopic,
            "m.room.create" => Self::RoomCreate,
            "m.room.join_rules" => Self::RoomJoinRules,
            "m.room.guest_access" => Self::RoomGuestAccess,
            "m.room.aliases" => Self::RoomAliases,
            "m.room.canonical_alias" => Self::RoomCanonicalAlias,
            "m.room.history_visibility" => Self::RoomHistoryVisibility,
            "m.room.avatar" => Self::RoomAvatar,
            "m.room.member" => Self::RoomMember,
            "m.room.power_levels" => Self::RoomPowerLevels,
            "m.room.third_party_invite" => Self::RoomThirdPartyInvite,
            "m.room.tombstone" => Self::RoomTombstone,
            "m.room.pinned_events" => Self::RoomPinnedEvents,
            "m.room.encryption" => Self::RoomEncryption,
            "m.room.related_groups" => Self::RoomRelatedGroups,
            "m.room.message" => Self::RoomMessage,
            "m.presence" => Self::Presence,
            "m.typing" => Self::Typing,
            "m.room.redaction" => Self::Redaction,
            "m.receipt" => Self::Receipt,
            "m.tag" => Self::RoomTag,
            _ => Self::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_wire().to_owned()
    }
}

/// A single protocol event, state or timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event identifier.
    pub event_id: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Room the event belongs to; absent for account-level events.
    pub room_id: Option<String>,
    /// User who sent the event.
    pub sender: Option<String>,
    /// State key; presence marks the event as a state event.
    pub state_key: Option<String>,
    /// Server-side timestamp, milliseconds since the epoch.
    #[serde(default)]
    pub origin_server_ts: u64,
    /// Raw event content.
    #[serde(default)]
    pub content: Value,
    /// Content before this event, for un-applying while back-paginating.
    #[serde(default)]
    pub prev_content: Option<Value>,
    /// Pagination boundary token stamped onto the edge events of an
    /// accepted page; never present on live events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pagination_token: Option<String>,
}

impl Event {
    /// True when the event carries room state.
    pub fn is_state_event(&self) -> bool {
        self.state_key.is_some()
    }

    /// Content relevant for the given traversal direction.
    ///
    /// Walking backwards restores the previous state, so `prev_content`
    /// wins; when the event created the state there is nothing to restore
    /// and `Value::Null` is returned.
    pub fn content_for(&self, direction: Direction) -> &Value {
        match direction {
            Direction::Forwards => &self.content,
            Direction::Backwards => self.prev_content.as_ref().unwrap_or(&Value::Null),
        }
    }

    /// String field lookup in the event payload by dotted path, covering
    /// the top-level envelope and `content.*` keys.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "type" => Some(self.event_type.as_wire()),
            "room_id" => self.room_id.as_deref(),
            "user_id" | "sender" => self.sender.as_deref(),
            "state_key" => self.state_key.as_deref(),
            _ => {
                let path = key.strip_prefix("content.")?;
                let mut cursor = &self.content;
                for part in path.split('.') {
                    cursor = cursor.get(part)?;
                }
                cursor.as_str()
            }
        }
    }
}

/// A page of historical events and the tokens bounding it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenPage {
    /// Token at the edge the page was requested from.
    pub start: Option<String>,
    /// Token to continue from; `None` from the server means the history
    /// is exhausted.
    pub end: Option<String>,
    /// Events in the page, ordered from the requested edge outwards.
    pub events: Vec<Event>,
}

impl TokenPage {
    /// An empty page, used when history is already exhausted.
    pub fn empty() -> Self {
        Self::default()
    }
}
