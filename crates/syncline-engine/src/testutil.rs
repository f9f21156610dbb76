//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use syncline_core::{Direction, Event, EventType, RoomMember, RuleSet, SyncError, TokenPage};

use crate::traits::{SessionHooks, Store, Transport};

pub fn message_event(room_id: &str, event_id: &str, sender: &str, body: &str) -> Event {
    Event {
        event_id: event_id.into(),
        event_type: EventType::RoomMessage,
        room_id: Some(room_id.into()),
        sender: Some(sender.into()),
        state_key: None,
        origin_server_ts: 0,
        content: json!({ "msgtype": "m.text", "body": body }),
        prev_content: None,
        pagination_token: None,
    }
}

/// Store backed by per-room vectors, oldest first.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    events: HashMap<String, Vec<Event>>,
    receipts: HashMap<(String, String), String>,
    /// Canned responses for `earlier_messages`, keyed by request token.
    cached_pages: HashMap<(String, Option<String>), TokenPage>,
}

impl MemoryStore {
    pub fn seed_events(&self, room_id: &str, events: Vec<Event>) {
        let mut inner = self.inner.lock().expect("store lock");
        inner.events.insert(room_id.to_owned(), events);
    }

    pub fn seed_cached_page(&self, room_id: &str, from_token: Option<&str>, page: TokenPage) {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .cached_pages
            .insert((room_id.to_owned(), from_token.map(str::to_owned)), page);
    }

    pub fn events(&self, room_id: &str) -> Vec<Event> {
        let inner = self.inner.lock().expect("store lock");
        inner.events.get(room_id).cloned().unwrap_or_default()
    }

    fn position(events: &[Event], event_id: &str) -> Option<usize> {
        events.iter().position(|e| e.event_id == event_id)
    }
}

impl Store for MemoryStore {
    fn earlier_messages(
        &self,
        room_id: &str,
        from_token: Option<&str>,
        _limit: u32,
    ) -> Option<TokenPage> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .cached_pages
            .get(&(room_id.to_owned(), from_token.map(str::to_owned)))
            .cloned()
    }

    fn latest_event(&self, room_id: &str) -> Option<Event> {
        let inner = self.inner.lock().expect("store lock");
        inner.events.get(room_id).and_then(|v| v.last().cloned())
    }

    fn oldest_event(&self, room_id: &str) -> Option<Event> {
        let inner = self.inner.lock().expect("store lock");
        inner.events.get(room_id).and_then(|v| v.first().cloned())
    }

    fn event(&self, room_id: &str, event_id: &str) -> Option<Event> {
        let inner = self.inner.lock().expect("store lock");
        let events = inner.events.get(room_id)?;
        events.iter().find(|e| e.event_id == event_id).cloned()
    }

    fn store_events(&self, room_id: &str, events: &[Event], direction: Direction) {
        let mut inner = self.inner.lock().expect("store lock");
        let room = inner.events.entry(room_id.to_owned()).or_default();
        match direction {
            Direction::Forwards => {
                for event in events {
                    if Self::position(room, &event.event_id).is_none() {
                        room.push(event.clone());
                    }
                }
            }
            Direction::Backwards => {
                // pages arrive newest first; prepend keeps oldest-first order
                for event in events {
                    if Self::position(room, &event.event_id).is_none() {
                        room.insert(0, event.clone());
                    }
                }
            }
        }
    }

    fn is_event_read(&self, room_id: &str, user_id: &str, event_id: &str) -> bool {
        let inner = self.inner.lock().expect("store lock");
        let Some(events) = inner.events.get(room_id) else {
            return false;
        };
        let Some(receipt) = inner.receipts.get(&(room_id.to_owned(), user_id.to_owned())) else {
            return false;
        };
        match (
            Self::position(events, event_id),
            Self::position(events, receipt),
        ) {
            (Some(event_pos), Some(receipt_pos)) => event_pos <= receipt_pos,
            _ => false,
        }
    }

    fn store_receipt(&self, room_id: &str, user_id: &str, event_id: &str) -> bool {
        if self.is_event_read(room_id, user_id, event_id) {
            return false;
        }
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .receipts
            .insert((room_id.to_owned(), user_id.to_owned()), event_id.to_owned());
        true
    }

    fn events_count_after(&self, room_id: &str, event_id: &str) -> u32 {
        let inner = self.inner.lock().expect("store lock");
        let Some(events) = inner.events.get(room_id) else {
            return 0;
        };
        match Self::position(events, event_id) {
            Some(pos) => (events.len() - pos - 1) as u32,
            None => 0,
        }
    }
}

/// Transport answering from pre-loaded response queues.
#[derive(Default)]
pub struct ScriptedTransport {
    history: Mutex<VecDeque<Result<TokenPage, SyncError>>>,
    rules: Mutex<VecDeque<Result<RuleSet, SyncError>>>,
    members: Mutex<HashMap<String, VecDeque<Result<Vec<RoomMember>, SyncError>>>>,
    sends: Mutex<VecDeque<Result<String, SyncError>>>,
    pub history_calls: AtomicU32,
    pub member_calls: AtomicU32,
    pub send_calls: AtomicU32,
    pub marker_calls: Mutex<Vec<(Option<String>, Option<String>)>>,
}

impl ScriptedTransport {
    pub fn push_history(&self, response: Result<TokenPage, SyncError>) {
        self.history.lock().expect("lock").push_back(response);
    }

    pub fn push_rules(&self, response: Result<RuleSet, SyncError>) {
        self.rules.lock().expect("lock").push_back(response);
    }

    pub fn push_members(&self, room_id: &str, response: Result<Vec<RoomMember>, SyncError>) {
        self.members
            .lock()
            .expect("lock")
            .entry(room_id.to_owned())
            .or_default()
            .push_back(response);
    }

    pub fn push_send(&self, response: Result<String, SyncError>) {
        self.sends.lock().expect("lock").push_back(response);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch_history(
        &self,
        _room_id: &str,
        _from: Option<&str>,
        _direction: Direction,
        _limit: u32,
    ) -> Result<TokenPage, SyncError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.history
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Network("no scripted history".into())))
    }

    async fn fetch_rules(&self) -> Result<RuleSet, SyncError> {
        self.rules
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Network("no scripted rules".into())))
    }

    async fn fetch_members(&self, room_id: &str) -> Result<Vec<RoomMember>, SyncError> {
        self.member_calls.fetch_add(1, Ordering::SeqCst);
        // hold the response until every waiter has registered
        tokio::task::yield_now().await;
        self.members
            .lock()
            .expect("lock")
            .get_mut(room_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(SyncError::Network("no scripted members".into())))
    }

    async fn send_event(
        &self,
        _room_id: &str,
        _txn_id: &str,
        _event_type: &str,
        _content: Value,
    ) -> Result<String, SyncError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.sends
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Network("no scripted send".into())))
    }

    async fn send_read_markers(
        &self,
        _room_id: &str,
        read_marker: Option<&str>,
        read_receipt: Option<&str>,
    ) -> Result<(), SyncError> {
        // a round trip concurrent work can interleave with
        tokio::task::yield_now().await;
        self.marker_calls.lock().expect("lock").push((
            read_marker.map(str::to_owned),
            read_receipt.map(str::to_owned),
        ));
        Ok(())
    }
}

/// Hooks recording every escalation.
#[derive(Default)]
pub struct RecordingHooks {
    pub configuration_errors: Mutex<Vec<SyncError>>,
    pub security_errors: Mutex<Vec<SyncError>>,
}

impl SessionHooks for RecordingHooks {
    fn on_configuration_error(&self, error: &SyncError) {
        self.configuration_errors
            .lock()
            .expect("lock")
            .push(error.clone());
    }

    fn on_security_error(&self, error: &SyncError) {
        self.security_errors.lock().expect("lock").push(error.clone());
    }
}
