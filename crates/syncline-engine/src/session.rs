use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use syncline_core::{
    BingRule, DeliveryRetryPolicy, Direction, Event, EventType, ProfileProvider,
    RoomNotificationState, RoomState, RoomSummary, RuleEngine, SyncError, TokenPage,
};

use crate::delivery::DeliveryManager;
use crate::members::MemberLoader;
use crate::pagination::{PaginationController, PaginationKind};
use crate::read_state::ReadStateManager;
use crate::traits::{EncryptionHook, SessionHooks, Store, Transport};

/// Profile provider that knows nobody; the default until one is wired in.
struct NoProfiles;

impl ProfileProvider for NoProfiles {
    fn display_name(&self, _user_id: &str) -> Option<String> {
        None
    }
}

/// The synchronization core of one logged-in account.
///
/// Owns the per-room reducer states and summaries (one writer per room,
/// snapshot reads), the rule engine behind a copy-and-replace swap, and
/// the pagination, read-state, member and delivery machinery.
pub struct SyncSession {
    user_id: String,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    profiles: Arc<dyn ProfileProvider + Send + Sync>,
    encryption: Option<Arc<dyn EncryptionHook>>,
    rooms: Mutex<HashMap<String, RoomState>>,
    summaries: Mutex<HashMap<String, RoomSummary>>,
    engine: RwLock<RuleEngine>,
    pagination: PaginationController,
    delivery: DeliveryManager,
    read_state: ReadStateManager,
    members: MemberLoader,
}

impl SyncSession {
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            store: store.clone(),
            transport: transport.clone(),
            profiles: Arc::new(NoProfiles),
            encryption: None,
            rooms: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
            engine: RwLock::new(RuleEngine::new(user_id.clone())),
            pagination: PaginationController::new(store.clone(), transport.clone()),
            delivery: DeliveryManager::new(DeliveryRetryPolicy::default(), hooks),
            read_state: ReadStateManager::new(store, transport.clone(), user_id.clone()),
            members: MemberLoader::new(transport),
            user_id,
        }
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileProvider + Send + Sync>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_encryption(mut self, encryption: Arc<dyn EncryptionHook>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn delivery(&self) -> &DeliveryManager {
        &self.delivery
    }

    pub fn pagination(&self) -> &PaginationController {
        &self.pagination
    }

    /// Apply one room's slice of a sync response.
    ///
    /// State events fold into the room state, timeline events land in
    /// the store and the summary, notification counters grow per the
    /// rule engine, and unread counters are recomputed once at the end
    /// of the batch.
    pub fn apply_forward_sync(&self, room_id: &str, events: &[Event]) {
        self.read_state.begin_sync_batch();

        {
            let mut rooms = self.rooms.lock().expect("rooms lock");
            let state = rooms
                .entry(room_id.to_owned())
                .or_insert_with(|| RoomState::new(room_id));
            let mut summaries = self.summaries.lock().expect("summaries lock");
            let summary = summaries
                .entry(room_id.to_owned())
                .or_insert_with(|| RoomSummary::new(room_id));
            let engine = self.engine.read().expect("engine lock");

            for event in events {
                if event.event_type == EventType::Receipt {
                    self.ingest_receipts(room_id, summary, event);
                    continue;
                }

                if event.is_state_event() {
                    state.apply(event, Direction::Forwards);
                    if event.event_type == EventType::RoomMember
                        && event.state_key.as_deref() == Some(self.user_id.as_str())
                    {
                        summary.membership =
                            state.member(&self.user_id).and_then(|m| m.membership);
                    }
                }

                self.store
                    .store_events(room_id, std::slice::from_ref(event), Direction::Forwards);
                summary.push_latest_event(event);
                self.read_state.refresh_unread(room_id, summary);

                if let Some(rule) =
                    engine.fulfilled_rule(event, Some(state), self.profiles.as_ref())
                {
                    if rule.should_notify() {
                        summary.notification_count += 1;
                        if rule.should_highlight() {
                            summary.highlight_count += 1;
                        }
                    }
                }
            }
        }

        for room in self.read_state.end_sync_batch() {
            let mut summaries = self.summaries.lock().expect("summaries lock");
            if let Some(summary) = summaries.get_mut(&room) {
                self.read_state.refresh_unread(&room, summary);
            }
        }
    }

    fn ingest_receipts(&self, room_id: &str, summary: &mut RoomSummary, event: &Event) {
        let Some(by_event) = event.content.as_object() else {
            warn!(room_id, "malformed receipt event skipped");
            return;
        };
        for (event_id, receipts) in by_event {
            let mine = receipts
                .get("m.read")
                .and_then(Value::as_object)
                .map_or(false, |readers| readers.contains_key(&self.user_id));
            if mine {
                self.read_state
                    .ingest_own_receipt(room_id, summary, event_id);
            }
        }
    }

    /// Point-in-time clone of a room's state.
    pub fn room_state(&self, room_id: &str) -> Option<RoomState> {
        let rooms = self.rooms.lock().expect("rooms lock");
        rooms.get(room_id).cloned()
    }

    /// Point-in-time clone of a room's summary.
    pub fn summary(&self, room_id: &str) -> Option<RoomSummary> {
        let summaries = self.summaries.lock().expect("summaries lock");
        summaries.get(room_id).cloned()
    }

    /// Disambiguated display name of a member, from the room's cache.
    pub fn member_name(&self, room_id: &str, user_id: &str) -> Option<String> {
        let mut rooms = self.rooms.lock().expect("rooms lock");
        rooms.get_mut(room_id).map(|state| state.member_name(user_id))
    }

    /// Fetch and swap in the account's push rules.
    pub async fn load_rules(&self) -> Result<(), SyncError> {
        let rules = self.transport.fetch_rules().await?;
        let mut engine = self.engine.write().expect("engine lock");
        engine.set_rules(rules);
        Ok(())
    }

    /// Evaluate one event against the current rules.
    pub fn evaluate(&self, event: &Event) -> Option<BingRule> {
        let rooms = self.rooms.lock().expect("rooms lock");
        let room = event.room_id.as_deref().and_then(|id| rooms.get(id));
        let engine = self.engine.read().expect("engine lock");
        engine
            .fulfilled_rule(event, room, self.profiles.as_ref())
            .cloned()
    }

    pub fn room_notification_state(&self, room_id: &str) -> RoomNotificationState {
        let mut engine = self.engine.write().expect("engine lock");
        engine.room_notification_state(room_id)
    }

    /// Page older history in, from the oldest loaded event.
    pub async fn back_paginate(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Option<TokenPage>, SyncError> {
        {
            let rooms = self.rooms.lock().expect("rooms lock");
            let summaries = self.summaries.lock().expect("summaries lock");
            if let Some(state) = rooms.get(room_id) {
                let membership = summaries.get(room_id).map(|s| (s.is_joined(), s.is_invited()));
                let (joined, invited) = membership.unwrap_or((false, false));
                if !state.can_back_paginate(joined, invited) {
                    return Err(SyncError::LocalData(format!(
                        "history of {room_id} is not visible"
                    )));
                }
            }
        }

        let from_token = self
            .store
            .oldest_event(room_id)
            .and_then(|event| event.pagination_token);
        self.pagination.back_paginate(room_id, from_token, limit).await
    }

    pub async fn forward_paginate(
        &self,
        room_id: &str,
        from_token: Option<String>,
        limit: u32,
    ) -> Result<Option<TokenPage>, SyncError> {
        self.pagination.forward_paginate(room_id, from_token, limit).await
    }

    /// Stop paginating a room, abandoning in-flight requests.
    pub fn cancel_pagination(&self, room_id: &str) {
        self.pagination.cancel_room(room_id);
    }

    /// Ensure the full member list of a room is loaded, coalescing
    /// concurrent calls onto a single fetch.
    pub async fn load_members(&self, room_id: &str) -> Result<(), SyncError> {
        {
            let rooms = self.rooms.lock().expect("rooms lock");
            if rooms.get(room_id).is_some_and(RoomState::all_members_loaded) {
                return Ok(());
            }
        }

        let fetched = self.members.fetch_members(room_id).await?;
        let mut rooms = self.rooms.lock().expect("rooms lock");
        let state = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| RoomState::new(room_id));
        for member in fetched {
            state.absorb_fetched_member(member);
        }
        state.set_all_members_loaded();
        debug!(room_id, "full member list loaded");
        Ok(())
    }

    /// Send an event with resilient delivery, encrypting it first when
    /// the room has encryption enabled.
    pub async fn send_with_retry(
        &self,
        room_id: &str,
        txn_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, SyncError> {
        let encrypted_room = {
            let rooms = self.rooms.lock().expect("rooms lock");
            rooms.get(room_id).is_some_and(RoomState::is_encrypted)
        };

        let (event_type, content) = match (&self.encryption, encrypted_room) {
            (Some(hook), true) => hook.encrypt(room_id, event_type, content).await?,
            _ => (event_type.to_owned(), content),
        };

        let op = self.delivery.register(format!("send {txn_id}"), false);
        self.delivery
            .run(op, || {
                self.transport
                    .send_event(room_id, txn_id, &event_type, content.clone())
            })
            .await
    }

    pub async fn mark_all_as_read(&self, room_id: &str) -> Result<bool, SyncError> {
        let before = self.summary_snapshot(room_id);
        let mut after = before.clone();
        let result = self.read_state.mark_all_as_read(room_id, &mut after).await;
        self.merge_read_state(room_id, &before, &after);
        result
    }

    pub async fn send_read_markers(
        &self,
        room_id: &str,
        read_marker: Option<&str>,
        read_receipt: Option<&str>,
    ) -> Result<bool, SyncError> {
        let before = self.summary_snapshot(room_id);
        let mut after = before.clone();
        let result = self
            .read_state
            .send_read_markers(room_id, &mut after, read_marker, read_receipt)
            .await;
        self.merge_read_state(room_id, &before, &after);
        result
    }

    pub async fn forget_read_marker(&self, room_id: &str) -> Result<bool, SyncError> {
        let before = self.summary_snapshot(room_id);
        let mut after = before.clone();
        let result = self.read_state.forget_read_marker(room_id, &mut after).await;
        self.merge_read_state(room_id, &before, &after);
        result
    }

    fn summary_snapshot(&self, room_id: &str) -> RoomSummary {
        let summaries = self.summaries.lock().expect("summaries lock");
        summaries
            .get(room_id)
            .cloned()
            .unwrap_or_else(|| RoomSummary::new(room_id))
    }

    /// Write back only what the read-state operation moved. Events
    /// synced while the transport call was in flight stay on the live
    /// summary, and the unread counter is recomputed against the store
    /// as it is now.
    fn merge_read_state(&self, room_id: &str, before: &RoomSummary, after: &RoomSummary) {
        let mut summaries = self.summaries.lock().expect("summaries lock");
        let live = summaries
            .entry(room_id.to_owned())
            .or_insert_with(|| RoomSummary::new(room_id));
        if after.read_marker_event_id != before.read_marker_event_id {
            live.read_marker_event_id = after.read_marker_event_id.clone();
        }
        if after.read_receipt_event_id != before.read_receipt_event_id {
            live.read_receipt_event_id = after.read_receipt_event_id.clone();
            live.notification_count = after.notification_count;
            live.highlight_count = after.highlight_count;
            self.read_state.refresh_unread(room_id, live);
        }
    }
}
