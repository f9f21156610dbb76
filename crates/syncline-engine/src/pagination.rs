use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use syncline_core::{Direction, SyncError, TokenPage, END_OF_HISTORY_TOKEN};

use crate::traits::{Store, Transport};

/// The three independent pagination streams a room can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaginationKind {
    /// Walking into history from the oldest loaded event.
    Backwards,
    /// Catching up towards the live edge.
    Forwards,
    /// Fetching context around a permalink; never cached.
    RemoteHistory,
}

/// Where a pagination stream currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    Idle,
    WaitingLocal,
    WaitingRemote,
}

struct Pending {
    token: Option<String>,
    state: PaginationState,
}

/// Serializes history requests per room and direction.
///
/// At most one request per (room, kind) is in flight; its token is
/// recorded on entry and checked again on resolution. A result whose
/// token no longer matches was superseded (new request or cancellation)
/// and resolves as `Ok(None)`, errors included.
pub struct PaginationController {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<(String, PaginationKind), Pending>>,
}

impl PaginationController {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of a pagination stream.
    pub fn state(&self, room_id: &str, kind: PaginationKind) -> PaginationState {
        let pending = self.pending.lock().expect("pagination lock");
        pending
            .get(&(room_id.to_owned(), kind))
            .map_or(PaginationState::Idle, |p| p.state)
    }

    /// Abandon the in-flight request of one stream, if any.
    pub fn cancel(&self, room_id: &str, kind: PaginationKind) {
        let mut pending = self.pending.lock().expect("pagination lock");
        pending.remove(&(room_id.to_owned(), kind));
    }

    /// Abandon every in-flight request of a room.
    pub fn cancel_room(&self, room_id: &str) {
        let mut pending = self.pending.lock().expect("pagination lock");
        pending.retain(|(room, _), _| room != room_id);
    }

    /// Page older events in, cache first.
    ///
    /// `Ok(None)` means the request was superseded and produced nothing;
    /// the newer request owns the stream now.
    pub async fn back_paginate(
        &self,
        room_id: &str,
        from_token: Option<String>,
        limit: u32,
    ) -> Result<Option<TokenPage>, SyncError> {
        if from_token.as_deref() == Some(END_OF_HISTORY_TOKEN) {
            // History is exhausted; answer without touching the network.
            let mut page = TokenPage::empty();
            page.start = from_token.clone();
            page.end = from_token;
            return Ok(Some(page));
        }

        if !self.begin(room_id, PaginationKind::Backwards, &from_token) {
            return Ok(None);
        }

        // Give a superseding caller a chance to land before the cache read.
        tokio::task::yield_now().await;

        if let Some(page) = self.store.earlier_messages(room_id, from_token.as_deref(), limit) {
            if !self.finish(room_id, PaginationKind::Backwards, &from_token) {
                return Ok(None);
            }
            return Ok(Some(page));
        }

        if !self.advance_to_remote(room_id, PaginationKind::Backwards, &from_token) {
            return Ok(None);
        }

        let result = self
            .transport
            .fetch_history(room_id, from_token.as_deref(), Direction::Backwards, limit)
            .await;

        if !self.finish(room_id, PaginationKind::Backwards, &from_token) {
            debug!(room_id, "superseded back pagination dropped");
            return Ok(None);
        }

        let mut page = result?;
        if page.end.is_none() {
            page.end = Some(END_OF_HISTORY_TOKEN.to_owned());
        }

        // The server repeats the event the token points at; drop the
        // overlap with what is already cached.
        if let (Some(first), Some(oldest)) = (page.events.first(), self.store.oldest_event(room_id))
        {
            if first.event_id == oldest.event_id {
                page.events.remove(0);
            }
        }

        stamp_boundary_tokens(&mut page);
        self.store
            .store_events(room_id, &page.events, Direction::Backwards);
        Ok(Some(page))
    }

    /// Page towards the live edge. Network only; accepted pages are
    /// written back to the cache.
    pub async fn forward_paginate(
        &self,
        room_id: &str,
        from_token: Option<String>,
        limit: u32,
    ) -> Result<Option<TokenPage>, SyncError> {
        let page = self
            .remote_fetch(room_id, PaginationKind::Forwards, &from_token, limit)
            .await?;
        Ok(page.map(|mut page| {
            stamp_boundary_tokens(&mut page);
            self.store
                .store_events(room_id, &page.events, Direction::Forwards);
            page
        }))
    }

    /// Fetch history around a remote context without touching the cache.
    pub async fn remote_history(
        &self,
        room_id: &str,
        from_token: Option<String>,
        limit: u32,
    ) -> Result<Option<TokenPage>, SyncError> {
        let page = self
            .remote_fetch(room_id, PaginationKind::RemoteHistory, &from_token, limit)
            .await?;
        Ok(page.map(|mut page| {
            stamp_boundary_tokens(&mut page);
            page
        }))
    }

    async fn remote_fetch(
        &self,
        room_id: &str,
        kind: PaginationKind,
        from_token: &Option<String>,
        limit: u32,
    ) -> Result<Option<TokenPage>, SyncError> {
        if !self.begin(room_id, kind, from_token) {
            return Ok(None);
        }
        if !self.advance_to_remote(room_id, kind, from_token) {
            return Ok(None);
        }

        let direction = match kind {
            PaginationKind::Backwards => Direction::Backwards,
            _ => Direction::Forwards,
        };
        let result = self
            .transport
            .fetch_history(room_id, from_token.as_deref(), direction, limit)
            .await;

        if !self.finish(room_id, kind, from_token) {
            debug!(room_id, ?kind, "superseded pagination dropped");
            return Ok(None);
        }
        result.map(Some)
    }

    /// Record a new in-flight request. Returns false when the same token
    /// is already being fetched for this stream.
    fn begin(&self, room_id: &str, kind: PaginationKind, token: &Option<String>) -> bool {
        let mut pending = self.pending.lock().expect("pagination lock");
        let key = (room_id.to_owned(), kind);
        if let Some(current) = pending.get(&key) {
            if current.token == *token {
                debug!(room_id, ?kind, "pagination already in flight");
                return false;
            }
        }
        pending.insert(
            key,
            Pending {
                token: token.clone(),
                state: PaginationState::WaitingLocal,
            },
        );
        true
    }

    fn advance_to_remote(
        &self,
        room_id: &str,
        kind: PaginationKind,
        token: &Option<String>,
    ) -> bool {
        let mut pending = self.pending.lock().expect("pagination lock");
        match pending.get_mut(&(room_id.to_owned(), kind)) {
            Some(current) if current.token == *token => {
                current.state = PaginationState::WaitingRemote;
                true
            }
            _ => false,
        }
    }

    /// Clear the pending slot if this request still owns it.
    fn finish(&self, room_id: &str, kind: PaginationKind, token: &Option<String>) -> bool {
        let mut pending = self.pending.lock().expect("pagination lock");
        let key = (room_id.to_owned(), kind);
        match pending.get(&key) {
            Some(current) if current.token == *token => {
                pending.remove(&key);
                true
            }
            _ => false,
        }
    }
}

fn stamp_boundary_tokens(page: &mut TokenPage) {
    if let Some(first) = page.events.first_mut() {
        first.pagination_token = page.start.clone();
    }
    if let Some(last) = page.events.last_mut() {
        last.pagination_token = page.end.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{message_event, MemoryStore, ScriptedTransport};
    use std::sync::atomic::Ordering;

    const ROOM: &str = "!room:hs";

    fn controller() -> (Arc<MemoryStore>, Arc<ScriptedTransport>, PaginationController) {
        let store = Arc::new(MemoryStore::default());
        let transport = Arc::new(ScriptedTransport::default());
        let controller = PaginationController::new(store.clone(), transport.clone());
        (store, transport, controller)
    }

    fn page(start: &str, end: Option<&str>, ids: &[&str]) -> TokenPage {
        TokenPage {
            start: Some(start.into()),
            end: end.map(str::to_owned),
            events: ids
                .iter()
                .map(|id| message_event(ROOM, id, "@bob:hs", "hi"))
                .collect(),
        }
    }

    #[tokio::test]
    async fn end_of_history_short_circuits() {
        let (_, transport, controller) = controller();
        let result = controller
            .back_paginate(ROOM, Some(END_OF_HISTORY_TOKEN.into()), 20)
            .await
            .expect("page")
            .expect("present");
        assert!(result.events.is_empty());
        assert_eq!(transport.history_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn serves_from_cache_before_the_network() {
        let (store, transport, controller) = controller();
        store.seed_cached_page(ROOM, Some("t10"), page("t10", Some("t5"), &["$a", "$b"]));

        let result = controller
            .back_paginate(ROOM, Some("t10".into()), 20)
            .await
            .expect("page")
            .expect("present");
        assert_eq!(result.events.len(), 2);
        assert_eq!(transport.history_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            controller.state(ROOM, PaginationKind::Backwards),
            PaginationState::Idle
        );
    }

    #[tokio::test]
    async fn network_page_is_stamped_and_written_back() {
        let (store, transport, controller) = controller();
        transport.push_history(Ok(page("t10", None, &["$a", "$b"])));

        let result = controller
            .back_paginate(ROOM, Some("t10".into()), 20)
            .await
            .expect("page")
            .expect("present");

        // a null end token marks exhausted history
        assert_eq!(result.end.as_deref(), Some(END_OF_HISTORY_TOKEN));
        assert_eq!(result.events[0].pagination_token.as_deref(), Some("t10"));
        assert_eq!(
            result.events[1].pagination_token.as_deref(),
            Some(END_OF_HISTORY_TOKEN)
        );
        assert_eq!(store.events(ROOM).len(), 2);
    }

    #[tokio::test]
    async fn trims_the_overlap_with_cached_history() {
        let (store, transport, controller) = controller();
        store.seed_events(ROOM, vec![message_event(ROOM, "$a", "@bob:hs", "old")]);
        transport.push_history(Ok(page("t10", Some("t5"), &["$a", "$b", "$c"])));

        let result = controller
            .back_paginate(ROOM, Some("t10".into()), 20)
            .await
            .expect("page")
            .expect("present");
        assert_eq!(
            result.events.iter().map(|e| e.event_id.as_str()).collect::<Vec<_>>(),
            vec!["$b", "$c"]
        );
        // $a was already cached; $b and $c were prepended
        assert_eq!(store.events(ROOM).len(), 3);
    }

    #[tokio::test]
    async fn duplicate_request_for_the_same_token_is_dropped() {
        let (_, transport, controller) = controller();
        transport.push_history(Ok(page("t10", Some("t5"), &["$a"])));

        let (first, second) = tokio::join!(
            controller.back_paginate(ROOM, Some("t10".into()), 20),
            controller.back_paginate(ROOM, Some("t10".into()), 20),
        );
        let pages = [first.expect("first"), second.expect("second")];
        assert_eq!(pages.iter().filter(|p| p.is_some()).count(), 1);
        assert_eq!(transport.history_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_newer_token_supersedes_the_older_request() {
        let (_, transport, controller) = controller();
        transport.push_history(Ok(page("t20", Some("t15"), &["$b"])));

        let (first, second) = tokio::join!(
            controller.back_paginate(ROOM, Some("t10".into()), 20),
            controller.back_paginate(ROOM, Some("t20".into()), 20),
        );
        // the older request lost the stream and produced nothing
        assert!(first.expect("first").is_none());
        let page = second.expect("second").expect("present");
        assert_eq!(page.events.len(), 1);
        assert_eq!(transport.history_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_supersedes_the_result() {
        let (_, transport, controller) = controller();
        transport.push_history(Ok(page("t10", Some("t5"), &["$a"])));

        let (result, ()) = tokio::join!(controller.back_paginate(ROOM, Some("t10".into()), 20), async {
            controller.cancel(ROOM, PaginationKind::Backwards);
        });
        assert_eq!(result.expect("ok"), None);
    }

    #[tokio::test]
    async fn errors_reach_the_caller_when_not_superseded() {
        let (_, transport, controller) = controller();
        transport.push_history(Err(SyncError::Network("gateway timeout".into())));

        let result = controller.back_paginate(ROOM, Some("t10".into()), 20).await;
        assert!(matches!(result, Err(SyncError::Network(_))));
        assert_eq!(
            controller.state(ROOM, PaginationKind::Backwards),
            PaginationState::Idle
        );
    }

    #[tokio::test]
    async fn forward_pages_append_to_the_cache() {
        let (store, transport, controller) = controller();
        store.seed_events(ROOM, vec![message_event(ROOM, "$a", "@bob:hs", "old")]);
        transport.push_history(Ok(page("t5", Some("t9"), &["$b", "$c"])));

        let result = controller
            .forward_paginate(ROOM, Some("t5".into()), 20)
            .await
            .expect("page")
            .expect("present");
        assert_eq!(result.events.len(), 2);
        assert_eq!(
            store
                .events(ROOM)
                .iter()
                .map(|e| e.event_id.as_str())
                .collect::<Vec<_>>(),
            vec!["$a", "$b", "$c"]
        );
    }

    #[tokio::test]
    async fn remote_history_never_touches_the_cache() {
        let (store, transport, controller) = controller();
        transport.push_history(Ok(page("ctx", Some("ctx2"), &["$x"])));

        let result = controller
            .remote_history(ROOM, Some("ctx".into()), 20)
            .await
            .expect("page")
            .expect("present");
        assert_eq!(result.events.len(), 1);
        assert!(store.events(ROOM).is_empty());
    }
}
