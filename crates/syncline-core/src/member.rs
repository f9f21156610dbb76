use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Membership of a user in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
    Knock,
    /// Synthesized when someone else's leave event removes a joined member.
    /// Never appears on the wire.
    Kick,
}

/// Wire payload of an `m.room.member` event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemberContent {
    pub membership: Option<Membership>,
    pub displayname: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub third_party_invite: Option<MemberThirdPartyInvite>,
}

/// Reference back to the third-party invite a member event redeems.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemberThirdPartyInvite {
    #[serde(default)]
    pub signed: SignedInvite,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SignedInvite {
    pub token: Option<String>,
}

/// A room member as tracked by the state reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    /// The member's user id (the event's state key).
    pub user_id: String,
    pub membership: Option<Membership>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    /// Id of the member event this entry was built from.
    pub origin_event_id: Option<String>,
    pub origin_server_ts: u64,
    /// Sender of the member event; differs from `user_id` for kicks, bans
    /// and invites.
    pub sender: Option<String>,
    /// Token of the third-party invite this membership redeemed.
    pub third_party_invite_token: Option<String>,
}

impl RoomMember {
    pub fn from_content(user_id: impl Into<String>, content: &MemberContent) -> Self {
        Self {
            user_id: user_id.into(),
            membership: content.membership,
            display_name: content.displayname.clone(),
            avatar_url: content.avatar_url.clone(),
            origin_event_id: None,
            origin_server_ts: 0,
            sender: None,
            third_party_invite_token: content
                .third_party_invite
                .as_ref()
                .and_then(|invite| invite.signed.token.clone()),
        }
    }

    /// Compare only the wire-provided fields. Two events carrying the same
    /// payload for the same user are replays of each other.
    pub fn payload_eq(&self, other: &RoomMember) -> bool {
        self.membership == other.membership
            && self.display_name == other.display_name
            && self.avatar_url == other.avatar_url
    }
}

/// A pending third-party (email) invite, keyed by its token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThirdPartyInvite {
    pub display_name: Option<String>,
    /// The invite token (the originating event's state key).
    pub token: String,
}

fn default_fifty() -> i64 {
    50
}

/// Power-level table for a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerLevels {
    #[serde(default)]
    pub users: HashMap<String, i64>,
    #[serde(default)]
    pub users_default: i64,
    #[serde(default)]
    pub events: HashMap<String, i64>,
    #[serde(default)]
    pub events_default: i64,
    #[serde(default = "default_fifty")]
    pub state_default: i64,
    #[serde(default = "default_fifty")]
    pub ban: i64,
    #[serde(default = "default_fifty")]
    pub kick: i64,
    #[serde(default = "default_fifty")]
    pub redact: i64,
    #[serde(default = "default_fifty")]
    pub invite: i64,
    #[serde(default)]
    pub notifications: HashMap<String, i64>,
}

impl Default for PowerLevels {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            users_default: 0,
            events: HashMap::new(),
            events_default: 0,
            state_default: 50,
            ban: 50,
            kick: 50,
            redact: 50,
            invite: 50,
            notifications: HashMap::new(),
        }
    }
}

impl PowerLevels {
    /// Effective power level of a user.
    pub fn user_level(&self, user_id: &str) -> i64 {
        self.users.get(user_id).copied().unwrap_or(self.users_default)
    }

    /// Level required for the named notification key (`room` defaults to 50).
    pub fn notification_level(&self, key: &str) -> i64 {
        self.notifications.get(key).copied().unwrap_or(50)
    }
}
