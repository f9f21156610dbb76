use serde::{Deserialize, Serialize};

use crate::event::{Event, EventType};
use crate::member::Membership;

/// Lightweight per-room digest kept for room lists and badges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: String,
    /// Latest event worth rendering in a room list.
    pub latest_event: Option<Event>,
    /// Where the user's visible read marker sits.
    pub read_marker_event_id: Option<String>,
    /// Last event acknowledged to the server by a read receipt.
    pub read_receipt_event_id: Option<String>,
    /// Events after the read receipt in the loaded window; approximate.
    pub unread_count: u32,
    pub notification_count: u32,
    pub highlight_count: u32,
    /// The local user's membership in the room.
    pub membership: Option<Membership>,
    pub tags: Vec<String>,
}

impl RoomSummary {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    pub fn is_joined(&self) -> bool {
        self.membership == Some(Membership::Join)
    }

    pub fn is_invited(&self) -> bool {
        self.membership == Some(Membership::Invite)
    }

    /// Track the latest renderable event. Ephemeral and unrenderable
    /// types leave the digest untouched.
    pub fn push_latest_event(&mut self, event: &Event) {
        if is_renderable(&event.event_type) {
            self.latest_event = Some(event.clone());
        }
    }

    pub fn clear_unread_counters(&mut self) {
        self.unread_count = 0;
        self.notification_count = 0;
        self.highlight_count = 0;
    }
}

fn is_renderable(event_type: &EventType) -> bool {
    matches!(
        event_type,
        EventType::RoomMessage
            | EventType::RoomMember
            | EventType::RoomName
            | EventType::RoomTopic
            | EventType::RoomEncryption
            | EventType::RoomAvatar
            | EventType::RoomTombstone
    )
}
