use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use syncline_core::{RoomSummary, SyncError};

use crate::traits::{Store, Transport};

/// Shape check for event identifiers before they are sent to the server.
/// Malformed ids are treated as absent, never as errors.
pub fn is_valid_event_id(event_id: &str) -> bool {
    let Some(rest) = event_id.strip_prefix('$') else {
        return false;
    };
    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '_' | '-' | ':' | '.'))
}

/// Keeps the read marker and read receipt of each room reconciled with
/// the server.
///
/// Unread counters are recomputed from the store; while a sync batch is
/// being applied the recomputation is deferred and runs once at the end
/// of the batch.
pub struct ReadStateManager {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    user_id: String,
    syncing: AtomicBool,
    deferred: Mutex<HashSet<String>>,
}

impl ReadStateManager {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn Transport>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            transport,
            user_id: user_id.into(),
            syncing: AtomicBool::new(false),
            deferred: Mutex::new(HashSet::new()),
        }
    }

    /// Advance the read marker and/or read receipt.
    ///
    /// The marker only moves to events that differ from the current one
    /// and are not provably older; events missing from the store are
    /// assumed to be newer. The receipt is only published when the store
    /// does not already consider the event read. Returns whether anything
    /// was sent.
    pub async fn send_read_markers(
        &self,
        room_id: &str,
        summary: &mut RoomSummary,
        read_marker: Option<&str>,
        read_receipt: Option<&str>,
    ) -> Result<bool, SyncError> {
        let marker = self.validated(room_id, read_marker);
        let receipt = self.validated(room_id, read_receipt);

        let marker_moved = marker
            .map(|candidate| self.advance_marker(room_id, summary, candidate))
            .unwrap_or(false);
        let receipt_moved = receipt
            .map(|candidate| self.advance_receipt(room_id, summary, candidate))
            .unwrap_or(false);

        if !marker_moved && !receipt_moved {
            return Ok(false);
        }

        self.transport
            .send_read_markers(
                room_id,
                summary.read_marker_event_id.as_deref(),
                summary.read_receipt_event_id.as_deref(),
            )
            .await?;
        Ok(true)
    }

    /// Move both marker and receipt to the latest known event.
    pub async fn mark_all_as_read(
        &self,
        room_id: &str,
        summary: &mut RoomSummary,
    ) -> Result<bool, SyncError> {
        let Some(latest) = self.store.latest_event(room_id) else {
            return Ok(false);
        };
        self.send_read_markers(room_id, summary, Some(&latest.event_id), Some(&latest.event_id))
            .await
    }

    /// Snap the visible read marker back onto the read receipt.
    pub async fn forget_read_marker(
        &self,
        room_id: &str,
        summary: &mut RoomSummary,
    ) -> Result<bool, SyncError> {
        let Some(receipt) = summary.read_receipt_event_id.clone() else {
            return Ok(false);
        };
        if summary.read_marker_event_id.as_deref() == Some(receipt.as_str()) {
            return Ok(false);
        }

        summary.read_marker_event_id = Some(receipt.clone());
        self.transport
            .send_read_markers(room_id, Some(&receipt), None)
            .await?;
        Ok(true)
    }

    /// Absorb a receipt of the local user learned from the event stream.
    pub fn ingest_own_receipt(&self, room_id: &str, summary: &mut RoomSummary, event_id: &str) {
        if self.store.store_receipt(room_id, &self.user_id, event_id) {
            summary.read_receipt_event_id = Some(event_id.to_owned());
            self.refresh_unread(room_id, summary);
        }
    }

    /// Recompute the unread counter, or defer it while a sync batch is
    /// in progress.
    pub fn refresh_unread(&self, room_id: &str, summary: &mut RoomSummary) {
        if self.syncing.load(Ordering::SeqCst) {
            let mut deferred = self.deferred.lock().expect("deferred lock");
            deferred.insert(room_id.to_owned());
            return;
        }

        summary.unread_count = summary
            .read_receipt_event_id
            .as_deref()
            .map(|receipt| self.store.events_count_after(room_id, receipt))
            .unwrap_or(0);
    }

    pub fn begin_sync_batch(&self) {
        self.syncing.store(true, Ordering::SeqCst);
    }

    /// End the batch and return the rooms whose unread counters still
    /// need recomputing.
    pub fn end_sync_batch(&self) -> Vec<String> {
        self.syncing.store(false, Ordering::SeqCst);
        let mut deferred = self.deferred.lock().expect("deferred lock");
        deferred.drain().collect()
    }

    fn validated<'a>(&self, room_id: &str, event_id: Option<&'a str>) -> Option<&'a str> {
        match event_id {
            Some(id) if is_valid_event_id(id) => Some(id),
            Some(id) => {
                warn!(room_id, event_id = id, "dropping malformed event id");
                None
            }
            None => None,
        }
    }

    fn advance_marker(&self, room_id: &str, summary: &mut RoomSummary, candidate: &str) -> bool {
        if summary.read_marker_event_id.as_deref() == Some(candidate) {
            return false;
        }

        // Compare timestamps when both events are loaded; an event the
        // store has not seen yet is assumed to be in the future.
        let provably_older = match (
            self.store.event(room_id, candidate),
            summary
                .read_marker_event_id
                .as_deref()
                .and_then(|current| self.store.event(room_id, current)),
        ) {
            (Some(new), Some(current)) => new.origin_server_ts <= current.origin_server_ts,
            _ => false,
        };
        if provably_older {
            debug!(room_id, candidate, "read marker not moved backwards");
            return false;
        }

        summary.read_marker_event_id = Some(candidate.to_owned());
        true
    }

    fn advance_receipt(&self, room_id: &str, summary: &mut RoomSummary, candidate: &str) -> bool {
        if self.store.is_event_read(room_id, &self.user_id, candidate) {
            return false;
        }
        if !self.store.store_receipt(room_id, &self.user_id, candidate) {
            return false;
        }

        summary.read_receipt_event_id = Some(candidate.to_owned());
        let at_latest = self
            .store
            .latest_event(room_id)
            .map_or(false, |latest| latest.event_id == candidate);
        if at_latest {
            summary.clear_unread_counters();
        } else {
            self.refresh_unread(room_id, summary);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{message_event, MemoryStore, ScriptedTransport};

    const ROOM: &str = "!room:hs";
    const ME: &str = "@me:hs";

    fn manager() -> (Arc<MemoryStore>, Arc<ScriptedTransport>, ReadStateManager) {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(ScriptedTransport::default());
        let manager = ReadStateManager::new(store.clone(), transport.clone(), ME);
        (store, transport, manager)
    }

    fn seed_three(store: &MemoryStore) {
        store.seed_events(
            ROOM,
            vec![
                message_event(ROOM, "$1", "@bob:hs", "a"),
                message_event(ROOM, "$2", "@bob:hs", "b"),
                message_event(ROOM, "$3", "@bob:hs", "c"),
            ],
        );
    }

    #[test]
    fn event_id_validation() {
        assert!(is_valid_event_id("$abc123"));
        assert!(is_valid_event_id("$abc:example.org"));
        assert!(!is_valid_event_id("abc"));
        assert!(!is_valid_event_id("$"));
        assert!(!is_valid_event_id("$has space"));
    }

    #[tokio::test]
    async fn malformed_ids_are_treated_as_absent() {
        let (_, transport, manager) = manager();
        let mut summary = RoomSummary::new(ROOM);
        let sent = manager
            .send_read_markers(ROOM, &mut summary, Some("not-an-id"), None)
            .await
            .expect("ok");
        assert!(!sent);
        assert!(transport.marker_calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn marker_does_not_move_to_older_events() {
        let (store, transport, manager) = manager();
        seed_three(&store);
        let mut summary = RoomSummary::new(ROOM);

        // move to $2 first
        let mut events = store.events(ROOM);
        for (index, event) in events.iter_mut().enumerate() {
            event.origin_server_ts = (index as u64 + 1) * 100;
        }
        store.seed_events(ROOM, events);

        assert!(manager
            .send_read_markers(ROOM, &mut summary, Some("$2"), None)
            .await
            .expect("ok"));
        // $1 is provably older; nothing to send
        assert!(!manager
            .send_read_markers(ROOM, &mut summary, Some("$1"), None)
            .await
            .expect("ok"));
        assert_eq!(summary.read_marker_event_id.as_deref(), Some("$2"));
        // an event the store has never seen is assumed newer
        assert!(manager
            .send_read_markers(ROOM, &mut summary, Some("$future"), None)
            .await
            .expect("ok"));
        assert_eq!(transport.marker_calls.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn receipt_is_deduplicated() {
        let (store, transport, manager) = manager();
        seed_three(&store);
        let mut summary = RoomSummary::new(ROOM);

        assert!(manager
            .send_read_markers(ROOM, &mut summary, None, Some("$2"))
            .await
            .expect("ok"));
        assert!(!manager
            .send_read_markers(ROOM, &mut summary, None, Some("$2"))
            .await
            .expect("ok"));
        // a receipt for an already-read older event is also dropped
        assert!(!manager
            .send_read_markers(ROOM, &mut summary, None, Some("$1"))
            .await
            .expect("ok"));
        assert_eq!(transport.marker_calls.lock().expect("lock").len(), 1);
        assert_eq!(summary.unread_count, 1);
    }

    #[tokio::test]
    async fn counters_clear_only_at_the_latest_event() {
        let (store, _, manager) = manager();
        seed_three(&store);
        let mut summary = RoomSummary::new(ROOM);
        summary.notification_count = 4;
        summary.highlight_count = 2;

        manager
            .send_read_markers(ROOM, &mut summary, None, Some("$2"))
            .await
            .expect("ok");
        assert_eq!(summary.notification_count, 4);
        assert_eq!(summary.unread_count, 1);

        manager
            .send_read_markers(ROOM, &mut summary, None, Some("$3"))
            .await
            .expect("ok");
        assert_eq!(summary.notification_count, 0);
        assert_eq!(summary.unread_count, 0);
    }

    #[tokio::test]
    async fn mark_all_as_read_targets_the_latest_event() {
        let (store, _, manager) = manager();
        seed_three(&store);
        let mut summary = RoomSummary::new(ROOM);

        assert!(manager
            .mark_all_as_read(ROOM, &mut summary)
            .await
            .expect("ok"));
        assert_eq!(summary.read_marker_event_id.as_deref(), Some("$3"));
        assert_eq!(summary.read_receipt_event_id.as_deref(), Some("$3"));
        assert_eq!(summary.unread_count, 0);
    }

    #[tokio::test]
    async fn forget_read_marker_snaps_back_to_the_receipt() {
        let (store, transport, manager) = manager();
        seed_three(&store);
        let mut summary = RoomSummary::new(ROOM);
        summary.read_marker_event_id = Some("$3".into());
        summary.read_receipt_event_id = Some("$1".into());

        assert!(manager
            .forget_read_marker(ROOM, &mut summary)
            .await
            .expect("ok"));
        assert_eq!(summary.read_marker_event_id.as_deref(), Some("$1"));
        assert_eq!(
            transport.marker_calls.lock().expect("lock").last(),
            Some(&(Some("$1".to_owned()), None))
        );
    }

    #[tokio::test]
    async fn unread_refresh_is_deferred_during_a_batch() {
        let (store, _, manager) = manager();
        seed_three(&store);
        let mut summary = RoomSummary::new(ROOM);
        summary.read_receipt_event_id = Some("$1".into());

        manager.begin_sync_batch();
        manager.refresh_unread(ROOM, &mut summary);
        assert_eq!(summary.unread_count, 0);

        let deferred = manager.end_sync_batch();
        assert_eq!(deferred, vec![ROOM.to_owned()]);
        manager.refresh_unread(ROOM, &mut summary);
        assert_eq!(summary.unread_count, 2);
    }
}
