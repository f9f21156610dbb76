use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Well-known server-default rule ids.
pub mod rule_ids {
    pub const DISABLE_ALL: &str = ".m.rule.master";
    pub const CONTAINS_USER_NAME: &str = ".m.rule.contains_user_name";
    pub const CONTAINS_DISPLAY_NAME: &str = ".m.rule.contains_display_name";
    pub const ONE_TO_ONE: &str = ".m.rule.room_one_to_one";
    pub const INVITE_FOR_ME: &str = ".m.rule.invite_for_me";
    pub const MEMBER_EVENT: &str = ".m.rule.member_event";
    pub const CALL: &str = ".m.rule.call";
    pub const SUPPRESS_NOTICES: &str = ".m.rule.suppress_notices";
    pub const ALL_OTHER_MESSAGES: &str = ".m.rule.message";
    pub const FALLBACK: &str = ".m.rule.fallback";
}

/// Tweak names carried by `set_tweak` actions.
pub const TWEAK_SOUND: &str = "sound";
pub const TWEAK_HIGHLIGHT: &str = "highlight";

/// The five rule kinds, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Override,
    Content,
    Room,
    Sender,
    Underride,
}

impl Default for RuleKind {
    fn default() -> Self {
        Self::Underride
    }
}

/// Named rule actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionName {
    Notify,
    DontNotify,
    Coalesce,
}

/// One rule action; either a bare name or a tweak assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Name(ActionName),
    SetTweak {
        set_tweak: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
}

/// One rule condition. Kinds this client does not understand decode as
/// `Unknown` and never match, so an unknown condition silences its rule
/// instead of firing it for every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Glob match of `pattern` against the field addressed by `key`.
    EventMatch { key: String, pattern: String },
    /// The message body mentions the local user's display name.
    ContainsDisplayName,
    /// The joined member count satisfies the comparison in `is`.
    RoomMemberCount { is: String },
    /// The sender's power level reaches the notification level named by
    /// `key`.
    SenderNotificationPermission { key: String },
    #[serde(other)]
    Unknown,
}

/// A single push rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BingRule {
    pub rule_id: String,
    /// Stamped from the rule-set section during merging; not on the wire.
    #[serde(skip)]
    pub kind: RuleKind,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default, rename = "default")]
    pub is_default: bool,
    /// Content rules carry their body pattern here instead of a condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

fn enabled_default() -> bool {
    true
}

impl BingRule {
    pub fn new(kind: RuleKind, rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            kind,
            conditions: Vec::new(),
            actions: Vec::new(),
            enabled: true,
            is_default: false,
            pattern: None,
        }
    }

    /// True when the rule asks for a notification.
    pub fn should_notify(&self) -> bool {
        self.actions.contains(&Action::Name(ActionName::Notify))
    }

    /// True when the rule suppresses notifications.
    pub fn should_suppress(&self) -> bool {
        self.actions.contains(&Action::Name(ActionName::DontNotify))
    }

    fn tweak_value(&self, tweak: &str) -> Option<Option<&Value>> {
        self.actions.iter().find_map(|action| match action {
            Action::SetTweak { set_tweak, value } if set_tweak == tweak => {
                Some(value.as_ref())
            }
            _ => None,
        })
    }

    /// True when a highlight tweak is present and not explicitly false.
    pub fn should_highlight(&self) -> bool {
        match self.tweak_value(TWEAK_HIGHLIGHT) {
            Some(value) => value.and_then(Value::as_bool) != Some(false),
            None => false,
        }
    }

    /// Sound requested by the rule, if any.
    pub fn sound_name(&self) -> Option<&str> {
        self.tweak_value(TWEAK_SOUND)?.and_then(Value::as_str)
    }
}

/// The five per-kind rule lists as delivered by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default, rename = "override")]
    pub override_rules: Vec<BingRule>,
    #[serde(default)]
    pub content: Vec<BingRule>,
    #[serde(default)]
    pub room: Vec<BingRule>,
    #[serde(default)]
    pub sender: Vec<BingRule>,
    #[serde(default)]
    pub underride: Vec<BingRule>,
}

impl RuleSet {
    /// Flatten into evaluation order, stamping kinds and synthesizing the
    /// implicit condition each kind's shape stands for.
    pub fn merged(&self) -> Vec<BingRule> {
        let mut merged =
            Vec::with_capacity(self.rule_count());

        for rule in &self.override_rules {
            let mut rule = rule.clone();
            rule.kind = RuleKind::Override;
            merged.push(rule);
        }
        for rule in &self.content {
            let mut rule = rule.clone();
            rule.kind = RuleKind::Content;
            match rule.pattern.clone() {
                Some(pattern) => {
                    rule.conditions = vec![Condition::EventMatch {
                        key: "content.body".to_owned(),
                        pattern,
                    }];
                    merged.push(rule);
                }
                None => debug!(rule_id = %rule.rule_id, "content rule without pattern dropped"),
            }
        }
        for rule in &self.room {
            let mut rule = rule.clone();
            rule.kind = RuleKind::Room;
            rule.conditions = vec![Condition::EventMatch {
                key: "room_id".to_owned(),
                pattern: rule.rule_id.clone(),
            }];
            merged.push(rule);
        }
        for rule in &self.sender {
            let mut rule = rule.clone();
            rule.kind = RuleKind::Sender;
            rule.conditions = vec![Condition::EventMatch {
                key: "user_id".to_owned(),
                pattern: rule.rule_id.clone(),
            }];
            merged.push(rule);
        }
        for rule in &self.underride {
            let mut rule = rule.clone();
            rule.kind = RuleKind::Underride;
            merged.push(rule);
        }

        merged
    }

    fn rule_count(&self) -> usize {
        self.override_rules.len()
            + self.content.len()
            + self.room.len()
            + self.sender.len()
            + self.underride.len()
    }
}

/// Anchored glob match with `*` and `?`, case-insensitive.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let value: Vec<char> = value.to_lowercase().chars().collect();

    // Classic two-pointer walk with backtracking to the last `*`.
    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if let Some((star_p, star_v)) = star {
            p = star_p + 1;
            v = star_v + 1;
            star = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Case-insensitive search for `needle` in `haystack` bounded by non-word
/// characters (or the string edges) on both sides.
pub fn word_boundary_match(needle: &str, haystack: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let needle = needle.to_lowercase();
    let haystack = haystack.to_lowercase();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';

    let mut search_from = 0;
    while let Some(offset) = haystack[search_from..].find(&needle) {
        let start = search_from + offset;
        let end = start + needle.len();
        let before_ok = haystack[..start].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok = haystack[end..].chars().next().map_or(true, |c| !is_word(c));
        if before_ok && after_ok {
            return true;
        }
        // Advance past one full character to stay on a char boundary.
        search_from = start + haystack[start..].chars().next().map_or(1, char::len_utf8);
        if search_from >= haystack.len() {
            break;
        }
    }
    false
}

/// Match a body pattern the way content rules expect: literal patterns
/// search with word boundaries, globbed patterns match the whole body.
pub fn body_pattern_match(pattern: &str, body: &str) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        glob_match(pattern, body)
    } else {
        word_boundary_match(pattern, body)
    }
}

/// Parse and apply a member-count comparison like `"2"`, `"==2"`, `">=10"`.
pub fn member_count_satisfied(is: &str, count: u64) -> bool {
    let (op, digits) = match is {
        s if s.starts_with(">=") => (">=", &s[2..]),
        s if s.starts_with("<=") => ("<=", &s[2..]),
        s if s.starts_with("==") => ("==", &s[2..]),
        s if s.starts_with('>') => (">", &s[1..]),
        s if s.starts_with('<') => ("<", &s[1..]),
        s => ("==", s),
    };
    let Ok(bound) = digits.parse::<u64>() else {
        return false;
    };
    match op {
        ">=" => count >= bound,
        "<=" => count <= bound,
        ">" => count > bound,
        "<" => count < bound,
        _ => count == bound,
    }
}
