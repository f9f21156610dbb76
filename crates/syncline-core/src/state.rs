use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{Direction, Event, EventType};
use crate::member::{MemberContent, Membership, PowerLevels, RoomMember, ThirdPartyInvite};

/// Room join rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRule {
    Public,
    Invite,
    Knock,
    Private,
}

/// Guest access policy. Defaults to `Forbidden` when never set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestAccess {
    CanJoin,
    Forbidden,
}

/// History visibility policy. Defaults to `Shared` when never set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryVisibility {
    Invited,
    Joined,
    Shared,
    WorldReadable,
}

/// Payload of an `m.room.create` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateContent {
    pub creator: Option<String>,
    #[serde(default)]
    pub predecessor: Option<RoomPredecessor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomPredecessor {
    pub room_id: Option<String>,
    pub event_id: Option<String>,
}

/// Payload of an `m.room.tombstone` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TombstoneContent {
    pub body: Option<String>,
    pub replacement_room: Option<String>,
}

/// Scalar fields shared by most simple state events.
#[derive(Debug, Clone, Default, Deserialize)]
struct StateContent {
    name: Option<String>,
    topic: Option<String>,
    join_rule: Option<JoinRule>,
    guest_access: Option<GuestAccess>,
    history_visibility: Option<HistoryVisibility>,
    aliases: Option<Vec<String>>,
    #[serde(alias = "canonical_alias")]
    alias: Option<String>,
    url: Option<String>,
    algorithm: Option<String>,
    groups: Option<Vec<String>>,
    #[serde(default)]
    pinned: Vec<String>,
    display_name: Option<String>,
}

/// Accumulated state of a single room.
///
/// One writer applies events in order; readers get point-in-time clones.
#[derive(Debug, Clone, Default)]
pub struct RoomState {
    pub room_id: String,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub canonical_alias: Option<String>,
    pub avatar_url: Option<String>,
    pub join_rule: Option<JoinRule>,
    pub guest_access: Option<GuestAccess>,
    pub history_visibility: Option<HistoryVisibility>,
    pub create_content: Option<CreateContent>,
    pub tombstone: Option<TombstoneContent>,
    pub pinned_events: Vec<String>,
    pub related_groups: Vec<String>,
    pub power_levels: Option<PowerLevels>,
    /// `Some("")` after a malformed re-configuration; encryption stays on.
    algorithm: Option<String>,
    aliases_by_domain: HashMap<String, Vec<String>>,
    members: HashMap<String, RoomMember>,
    third_party_invites: HashMap<String, ThirdPartyInvite>,
    members_by_invite_token: HashMap<String, RoomMember>,
    /// Last state event seen per type, membership excluded.
    state_events: HashMap<EventType, Event>,
    display_name_cache: HashMap<String, String>,
    all_members_loaded: bool,
}

impl RoomState {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    /// Fold one state event into the room state.
    ///
    /// Returns `false` when the event changed nothing: a non-state event,
    /// a replayed member event, or the removal of an unknown member.
    pub fn apply(&mut self, event: &Event, direction: Direction) -> bool {
        let Some(state_key) = event.state_key.as_deref() else {
            return false;
        };

        let content = event.content_for(direction);

        match &event.event_type {
            EventType::RoomMember => {
                if !self.apply_member(event, state_key, content) {
                    return false;
                }
            }
            EventType::RoomPowerLevels => match serde_json::from_value(content.clone()) {
                Ok(levels) => self.power_levels = Some(levels),
                Err(err) => {
                    warn!(room_id = %self.room_id, %err, "skipping malformed power levels");
                    return true;
                }
            },
            EventType::RoomThirdPartyInvite => {
                if !content.is_null() && !state_key.is_empty() {
                    let parsed = decode_state_content(&self.room_id, content);
                    self.third_party_invites.insert(
                        state_key.to_owned(),
                        ThirdPartyInvite {
                            display_name: parsed.display_name,
                            token: state_key.to_owned(),
                        },
                    );
                }
            }
            EventType::RoomCreate => match serde_json::from_value(content.clone()) {
                Ok(create) => self.create_content = Some(create),
                Err(err) => warn!(room_id = %self.room_id, %err, "skipping malformed create event"),
            },
            EventType::RoomTombstone => match serde_json::from_value(content.clone()) {
                Ok(tombstone) => self.tombstone = Some(tombstone),
                Err(err) => warn!(room_id = %self.room_id, %err, "skipping malformed tombstone"),
            },
            other => {
                let parsed = decode_state_content(&self.room_id, content);
                match other {
                    EventType::RoomName => self.name = parsed.name,
                    EventType::RoomTopic => self.topic = parsed.topic,
                    EventType::RoomJoinRules => self.join_rule = parsed.join_rule,
                    EventType::RoomGuestAccess => self.guest_access = parsed.guest_access,
                    EventType::RoomHistoryVisibility => {
                        self.history_visibility = parsed.history_visibility
                    }
                    EventType::RoomCanonicalAlias => self.canonical_alias = parsed.alias,
                    EventType::RoomAvatar => self.avatar_url = parsed.url,
                    EventType::RoomRelatedGroups => {
                        self.related_groups = parsed.groups.unwrap_or_default()
                    }
                    EventType::RoomPinnedEvents => self.pinned_events = parsed.pinned,
                    EventType::RoomAliases => {
                        if !state_key.is_empty() {
                            self.aliases_by_domain
                                .insert(state_key.to_owned(), parsed.aliases.unwrap_or_default());
                        }
                    }
                    EventType::RoomEncryption => {
                        // Once encryption is enabled it can never be turned
                        // off again; a configuration event without an
                        // algorithm degrades to an empty marker instead.
                        self.algorithm = Some(parsed.algorithm.unwrap_or_default());
                    }
                    _ => {}
                }
            }
        }

        if event.event_type != EventType::RoomMember {
            self.state_events
                .insert(event.event_type.clone(), event.clone());
        }

        true
    }

    fn apply_member(&mut self, event: &Event, user_id: &str, content: &Value) -> bool {
        if content.is_null() {
            // The membership has already been erased upstream.
            if self.members.remove(user_id).is_none() {
                debug!(room_id = %self.room_id, user_id, "removal of unknown member ignored");
                return false;
            }
            self.display_name_cache.remove(user_id);
            return true;
        }

        let parsed: MemberContent = match serde_json::from_value(content.clone()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(room_id = %self.room_id, user_id, %err, "skipping malformed member event");
                return true;
            }
        };

        let mut member = RoomMember::from_content(user_id, &parsed);
        member.origin_event_id = Some(event.event_id.clone());
        member.origin_server_ts = event.origin_server_ts;
        member.sender = event.sender.clone();

        if let Some(current) = self.members.get(user_id) {
            if member.payload_eq(current) {
                debug!(room_id = %self.room_id, user_id, "duplicate member event ignored");
                return false;
            }

            if matches!(member.membership, Some(Membership::Leave) | Some(Membership::Ban)) {
                // Departure events drop the profile fields; keep the last
                // known values so the departed member stays renderable.
                if member.avatar_url.is_none() {
                    member.avatar_url = current.avatar_url.clone();
                }
                if member.display_name.is_none() {
                    member.display_name = current.display_name.clone();
                }

                if event.sender.as_deref() != Some(user_id)
                    && current.membership == Some(Membership::Join)
                    && member.membership == Some(Membership::Leave)
                {
                    member.membership = Some(Membership::Kick);
                }
            }
        }

        if let Some(token) = member.third_party_invite_token.clone() {
            self.members_by_invite_token.insert(token, member.clone());
        }

        self.display_name_cache.remove(user_id);
        self.members.insert(user_id.to_owned(), member);
        true
    }

    /// True once an encryption event has been seen, even a malformed one.
    pub fn is_encrypted(&self) -> bool {
        self.algorithm.is_some()
    }

    /// The configured encryption algorithm, if usable.
    pub fn encryption_algorithm(&self) -> Option<&str> {
        self.algorithm.as_deref().filter(|a| !a.is_empty())
    }

    /// True when the room has been replaced by a successor.
    pub fn is_versioned(&self) -> bool {
        self.tombstone.is_some()
    }

    pub fn is_public(&self) -> bool {
        self.join_rule == Some(JoinRule::Public)
    }

    pub fn guest_access(&self) -> GuestAccess {
        self.guest_access.unwrap_or(GuestAccess::Forbidden)
    }

    pub fn history_visibility(&self) -> HistoryVisibility {
        self.history_visibility.unwrap_or(HistoryVisibility::Shared)
    }

    /// Whether the local user may read older history.
    pub fn can_back_paginate(&self, is_joined: bool, is_invited: bool) -> bool {
        is_joined
            || match self.history_visibility() {
                HistoryVisibility::WorldReadable | HistoryVisibility::Shared => true,
                HistoryVisibility::Invited => is_invited,
                HistoryVisibility::Joined => false,
            }
    }

    pub fn member(&self, user_id: &str) -> Option<&RoomMember> {
        self.members.get(user_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &RoomMember> {
        self.members.values()
    }

    /// Members currently in the given membership.
    pub fn members_with_membership(&self, membership: Membership) -> Vec<&RoomMember> {
        self.members
            .values()
            .filter(|m| m.membership == Some(membership))
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn joined_member_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.membership == Some(Membership::Join))
            .count()
    }

    /// Register a member learned outside the event stream (a full member
    /// list fetch). Members already known from the stream win.
    pub fn absorb_fetched_member(&mut self, member: RoomMember) {
        if !self.members.contains_key(&member.user_id) {
            self.display_name_cache.remove(&member.user_id);
            self.members.insert(member.user_id.clone(), member);
        }
    }

    pub fn all_members_loaded(&self) -> bool {
        self.all_members_loaded
    }

    pub fn set_all_members_loaded(&mut self) {
        self.all_members_loaded = true;
    }

    pub fn third_party_invite(&self, token: &str) -> Option<&ThirdPartyInvite> {
        self.third_party_invites.get(token)
    }

    /// Member event that redeemed the given third-party invite token.
    pub fn member_by_invite_token(&self, token: &str) -> Option<&RoomMember> {
        self.members_by_invite_token.get(token)
    }

    /// All known aliases, merged across domains.
    pub fn aliases(&self) -> Vec<String> {
        let mut merged: Vec<String> = Vec::new();
        for aliases in self.aliases_by_domain.values() {
            for alias in aliases {
                if !merged.contains(alias) {
                    merged.push(alias.clone());
                }
            }
        }
        merged
    }

    pub fn aliases_for_domain(&self, domain: &str) -> Option<&[String]> {
        self.aliases_by_domain.get(domain).map(Vec::as_slice)
    }

    /// Last state event seen for a type (membership events excluded).
    pub fn state_event(&self, event_type: &EventType) -> Option<&Event> {
        self.state_events.get(event_type)
    }

    /// Display name of a member, disambiguated against the rest of the
    /// room as `name (user id)` when several members share it. Results are
    /// cached until the member changes.
    pub fn member_name(&mut self, user_id: &str) -> String {
        if let Some(cached) = self.display_name_cache.get(user_id) {
            return cached.clone();
        }

        let resolved = self.member_display_name(user_id);
        self.display_name_cache
            .insert(user_id.to_owned(), resolved.clone());
        resolved
    }

    /// Uncached variant of [`member_name`](Self::member_name).
    pub fn member_display_name(&self, user_id: &str) -> String {
        let member = self.members.get(user_id);
        let display_name = member
            .and_then(|m| m.display_name.as_deref())
            .filter(|name| !name.is_empty());

        match display_name {
            Some(name) => {
                let collisions = self
                    .members
                    .values()
                    .filter(|m| m.display_name.as_deref() == Some(name))
                    .count();
                if collisions > 1 {
                    format!("{name} ({user_id})")
                } else {
                    name.to_owned()
                }
            }
            None => user_id.to_owned(),
        }
    }
}

fn decode_state_content(room_id: &str, content: &Value) -> StateContent {
    match serde_json::from_value(content.clone()) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(room_id, %err, "skipping malformed state content");
            StateContent::default()
        }
    }
}
