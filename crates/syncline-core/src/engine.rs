use std::collections::HashMap;

use tracing::debug;

use crate::event::Event;
use crate::rules::{
    body_pattern_match, glob_match, member_count_satisfied, rule_ids, BingRule, Condition,
    RuleSet,
};
use crate::state::RoomState;

/// Source of account-level display names, used when a sender is not a
/// member of the room being evaluated.
pub trait ProfileProvider {
    fn display_name(&self, user_id: &str) -> Option<String>;
}

/// Provider that knows nobody.
impl ProfileProvider for () {
    fn display_name(&self, _user_id: &str) -> Option<String> {
        None
    }
}

/// Per-room notification posture derived from the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomNotificationState {
    /// All messages notify, with a sound.
    AllMessagesNoisy,
    /// All messages notify.
    AllMessages,
    /// Only mentions notify.
    MentionsOnly,
    /// Nothing from this room notifies.
    Mute,
}

/// Evaluates events against the account's push rules.
///
/// The engine answers nothing until the first rule set arrives; rule
/// updates replace the whole set and drop the per-room posture cache.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    my_user_id: String,
    rule_set: RuleSet,
    merged: Vec<BingRule>,
    ready: bool,
    posture_cache: HashMap<String, RoomNotificationState>,
}

impl RuleEngine {
    pub fn new(my_user_id: impl Into<String>) -> Self {
        Self {
            my_user_id: my_user_id.into(),
            ..Self::default()
        }
    }

    /// Swap in a freshly fetched rule set.
    pub fn set_rules(&mut self, rule_set: RuleSet) {
        self.merged = rule_set.merged();
        self.rule_set = rule_set;
        self.ready = true;
        self.posture_cache.clear();
        debug!(rules = self.merged.len(), "notification rules replaced");
    }

    /// False until the first rule set has been loaded.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rule_set
    }

    /// First enabled rule the event fulfills, in kind order.
    pub fn fulfilled_rule(
        &self,
        event: &Event,
        room: Option<&RoomState>,
        profile: &dyn ProfileProvider,
    ) -> Option<&BingRule> {
        self.fulfilled(event, room, profile, false)
    }

    /// Like [`fulfilled_rule`](Self::fulfilled_rule), restricted to rules
    /// that highlight.
    pub fn fulfilled_highlight_rule(
        &self,
        event: &Event,
        room: Option<&RoomState>,
        profile: &dyn ProfileProvider,
    ) -> Option<&BingRule> {
        self.fulfilled(event, room, profile, true)
    }

    fn fulfilled(
        &self,
        event: &Event,
        room: Option<&RoomState>,
        profile: &dyn ProfileProvider,
        highlight_only: bool,
    ) -> Option<&BingRule> {
        if !self.ready {
            return None;
        }
        if event.sender.as_deref() == Some(self.my_user_id.as_str()) {
            return None;
        }
        if !event.event_type.is_bingable() {
            return None;
        }

        self.merged.iter().find(|rule| {
            if !rule.enabled {
                return false;
            }
            if highlight_only && !rule.should_highlight() {
                return false;
            }
            match rule.rule_id.as_str() {
                rule_ids::CONTAINS_USER_NAME => self
                    .localpart()
                    .map_or(false, |name| body_mentions(event, name)),
                rule_ids::CONTAINS_DISPLAY_NAME => self
                    .my_display_name(room, profile)
                    .map_or(false, |name| body_mentions(event, &name)),
                rule_ids::FALLBACK => true,
                _ => rule
                    .conditions
                    .iter()
                    .all(|c| self.condition_satisfied(c, event, room, profile)),
            }
        })
    }

    fn condition_satisfied(
        &self,
        condition: &Condition,
        event: &Event,
        room: Option<&RoomState>,
        profile: &dyn ProfileProvider,
    ) -> bool {
        match condition {
            Condition::EventMatch { key, pattern } => {
                let Some(value) = event.lookup(key) else {
                    return false;
                };
                if key == "content.body" {
                    body_pattern_match(pattern, value)
                } else {
                    glob_match(pattern, value)
                }
            }
            Condition::ContainsDisplayName => self
                .my_display_name(room, profile)
                .map_or(false, |name| body_mentions(event, &name)),
            Condition::RoomMemberCount { is } => room
                .map_or(false, |r| {
                    member_count_satisfied(is, r.joined_member_count() as u64)
                }),
            Condition::SenderNotificationPermission { key } => {
                let (Some(room), Some(sender)) = (room, event.sender.as_deref()) else {
                    return false;
                };
                let Some(levels) = room.power_levels.as_ref() else {
                    return false;
                };
                levels.user_level(sender) >= levels.notification_level(key)
            }
            Condition::Unknown => {
                debug!("unknown rule condition never matches");
                false
            }
        }
    }

    fn localpart(&self) -> Option<&str> {
        self.my_user_id.strip_prefix('@')?.split(':').next()
    }

    fn my_display_name(
        &self,
        room: Option<&RoomState>,
        profile: &dyn ProfileProvider,
    ) -> Option<String> {
        // A room lookup that fell back to the bare user id is not a
        // display name; the account profile answers then.
        if let Some(room) = room {
            let name = room.member_display_name(&self.my_user_id);
            if name != self.my_user_id {
                return Some(name);
            }
        }
        profile.display_name(&self.my_user_id)
    }

    /// Notification posture of a room, computed once per rule-set
    /// generation.
    pub fn room_notification_state(&mut self, room_id: &str) -> RoomNotificationState {
        if let Some(state) = self.posture_cache.get(room_id) {
            return *state;
        }

        let state = self.compute_posture(room_id);
        self.posture_cache.insert(room_id.to_owned(), state);
        state
    }

    pub fn is_room_notifications_disabled(&mut self, room_id: &str) -> bool {
        self.room_notification_state(room_id) == RoomNotificationState::Mute
    }

    pub fn is_room_mention_only(&mut self, room_id: &str) -> bool {
        self.room_notification_state(room_id) == RoomNotificationState::MentionsOnly
    }

    fn compute_posture(&self, room_id: &str) -> RoomNotificationState {
        let muted = self.rule_set.override_rules.iter().any(|rule| {
            rule.enabled
                && rule.should_suppress()
                && rule.conditions.iter().any(|condition| {
                    matches!(
                        condition,
                        Condition::EventMatch { key, pattern }
                            if key == "room_id" && pattern == room_id
                    )
                })
        });
        if muted {
            return RoomNotificationState::Mute;
        }

        let room_rule = self
            .rule_set
            .room
            .iter()
            .find(|rule| rule.enabled && rule.rule_id == room_id);
        match room_rule {
            Some(rule) if rule.should_suppress() => RoomNotificationState::MentionsOnly,
            Some(rule) if rule.should_notify() && rule.sound_name().is_some() => {
                RoomNotificationState::AllMessagesNoisy
            }
            _ => RoomNotificationState::AllMessages,
        }
    }
}

fn body_mentions(event: &Event, name: &str) -> bool {
    event
        .lookup("content.body")
        .map_or(false, |body| crate::rules::word_boundary_match(name, body))
}
