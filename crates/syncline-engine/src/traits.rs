use async_trait::async_trait;
use serde_json::Value;
use syncline_core::{Direction, Event, RoomMember, RuleSet, SyncError, TokenPage};

/// Remote API surface the engine drives. Implementations own the HTTP
/// details and map failures onto [`SyncError`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a page of room history starting from `from`.
    async fn fetch_history(
        &self,
        room_id: &str,
        from: Option<&str>,
        direction: Direction,
        limit: u32,
    ) -> Result<TokenPage, SyncError>;

    /// Fetch the account's full push rule set.
    async fn fetch_rules(&self) -> Result<RuleSet, SyncError>;

    /// Fetch the full member list of a room.
    async fn fetch_members(&self, room_id: &str) -> Result<Vec<RoomMember>, SyncError>;

    /// Send an event; resolves to the server-assigned event id.
    async fn send_event(
        &self,
        room_id: &str,
        txn_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, SyncError>;

    /// Publish the user's read marker and/or read receipt.
    async fn send_read_markers(
        &self,
        room_id: &str,
        read_marker: Option<&str>,
        read_receipt: Option<&str>,
    ) -> Result<(), SyncError>;
}

/// Local event cache. Synchronous by design; implementations sit on
/// memory or an embedded database, never the network.
pub trait Store: Send + Sync {
    /// Cached page of messages older than `from_token`, if the cache can
    /// serve one.
    fn earlier_messages(
        &self,
        room_id: &str,
        from_token: Option<&str>,
        limit: u32,
    ) -> Option<TokenPage>;

    fn latest_event(&self, room_id: &str) -> Option<Event>;

    fn oldest_event(&self, room_id: &str) -> Option<Event>;

    fn event(&self, room_id: &str, event_id: &str) -> Option<Event>;

    /// Persist a batch of events at the live edge (`Forwards`) or the
    /// history edge (`Backwards`).
    fn store_events(&self, room_id: &str, events: &[Event], direction: Direction);

    /// True when the user's receipt already covers the event.
    fn is_event_read(&self, room_id: &str, user_id: &str, event_id: &str) -> bool;

    /// Record a read receipt; returns false when the stored receipt was
    /// already at or past the event.
    fn store_receipt(&self, room_id: &str, user_id: &str, event_id: &str) -> bool;

    /// Number of loaded events after the given one. Approximate by
    /// nature: only the loaded window is counted.
    fn events_count_after(&self, room_id: &str, event_id: &str) -> u32;
}

/// Encrypts outgoing content for rooms with encryption enabled.
#[async_trait]
pub trait EncryptionHook: Send + Sync {
    /// Transform plaintext type/content into their encrypted form.
    async fn encrypt(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<(String, Value), SyncError>;
}

/// Process-wide escalation points for failures retrying cannot fix.
pub trait SessionHooks: Send + Sync {
    /// The account's credentials are unusable (invalid or missing token).
    fn on_configuration_error(&self, error: &SyncError);

    /// A transport-security failure that must be surfaced to the user.
    fn on_security_error(&self, error: &SyncError);
}

/// Hooks implementation that ignores every escalation.
pub struct NoopHooks;

impl SessionHooks for NoopHooks {
    fn on_configuration_error(&self, _error: &SyncError) {}
    fn on_security_error(&self, _error: &SyncError) {}
}
