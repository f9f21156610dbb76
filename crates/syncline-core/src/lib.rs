//! Value model and synchronous logic for the syncline chat SDK core.
//!
//! This crate holds everything that needs no async runtime: the protocol
//! event model, the room-state reducer, the notification rule engine, the
//! delivery backoff policy, and the shared error taxonomy.

/// Notification rule evaluation.
pub mod engine;
/// Shared error taxonomy and protocol codes.
pub mod error;
/// Protocol events, types and pagination pages.
pub mod event;
/// Room members, memberships and power levels.
pub mod member;
/// Backoff policy used by the delivery manager.
pub mod retry;
/// Notification (bing) rule model and matchers.
pub mod rules;
/// The room-state reducer.
pub mod state;
/// Per-room digests for room lists and badges.
pub mod summary;

pub use engine::{ProfileProvider, RoomNotificationState, RuleEngine};
pub use error::{classify_http_status, codes, SyncError};
pub use event::{Direction, Event, EventType, TokenPage, END_OF_HISTORY_TOKEN};
pub use member::{MemberContent, Membership, PowerLevels, RoomMember, ThirdPartyInvite};
pub use retry::{DeliveryRetryPolicy, RATE_LIMIT_GUARD};
pub use rules::{Action, ActionName, BingRule, Condition, RuleKind, RuleSet};
pub use state::{
    CreateContent, GuestAccess, HistoryVisibility, JoinRule, RoomState, TombstoneContent,
};
pub use summary::RoomSummary;
