use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use syncline_core::{RoomMember, SyncError};

use crate::traits::Transport;

type MemberResult = Result<Vec<RoomMember>, SyncError>;

/// Coalesces concurrent full member-list fetches per room.
///
/// The first caller issues the request; everyone else waits on the same
/// response. Callers merge the result into room state themselves, which
/// keeps sync-learned members authoritative over a slow fetch.
pub struct MemberLoader {
    transport: Arc<dyn Transport>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<MemberResult>>>>,
}

impl MemberLoader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the member list of a room, joining an in-flight fetch when
    /// one exists.
    pub async fn fetch_members(&self, room_id: &str) -> MemberResult {
        let receiver = {
            let mut waiters = self.waiters.lock().await;
            match waiters.get_mut(room_id) {
                Some(list) => {
                    debug!(room_id, "joining in-flight member fetch");
                    let (tx, rx) = oneshot::channel();
                    list.push(tx);
                    Some(rx)
                }
                None => {
                    waiters.insert(room_id.to_owned(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = receiver {
            return rx.await.unwrap_or(Err(SyncError::Cancelled));
        }

        let result = self.transport.fetch_members(room_id).await;

        let pending = {
            let mut waiters = self.waiters.lock().await;
            waiters.remove(room_id).unwrap_or_default()
        };
        for waiter in pending {
            // a dropped waiter already lost interest
            let _ = waiter.send(result.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedTransport;
    use std::sync::atomic::Ordering;
    use syncline_core::Membership;

    fn member(user_id: &str) -> RoomMember {
        RoomMember {
            user_id: user_id.into(),
            membership: Some(Membership::Join),
            display_name: None,
            avatar_url: None,
            origin_event_id: None,
            origin_server_ts: 0,
            sender: None,
            third_party_invite_token: None,
        }
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_request() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_members("!room:hs", Ok(vec![member("@a:hs"), member("@b:hs")]));
        let loader = MemberLoader::new(transport.clone());

        let (first, second, third) = tokio::join!(
            loader.fetch_members("!room:hs"),
            loader.fetch_members("!room:hs"),
            loader.fetch_members("!room:hs"),
        );

        assert_eq!(first.expect("first").len(), 2);
        assert_eq!(second.expect("second").len(), 2);
        assert_eq!(third.expect("third").len(), 2);
        assert_eq!(transport.member_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_fan_out_to_every_waiter() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_members("!room:hs", Err(SyncError::Network("offline".into())));
        let loader = MemberLoader::new(transport.clone());

        let (first, second) = tokio::join!(
            loader.fetch_members("!room:hs"),
            loader.fetch_members("!room:hs"),
        );
        assert!(matches!(first, Err(SyncError::Network(_))));
        assert!(matches!(second, Err(SyncError::Network(_))));
    }

    #[tokio::test]
    async fn rooms_do_not_share_fetches() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_members("!one:hs", Ok(vec![member("@a:hs")]));
        transport.push_members("!two:hs", Ok(vec![member("@b:hs"), member("@c:hs")]));
        let loader = MemberLoader::new(transport.clone());

        let (first, second) = tokio::join!(
            loader.fetch_members("!one:hs"),
            loader.fetch_members("!two:hs"),
        );
        assert_eq!(first.expect("one").len(), 1);
        assert_eq!(second.expect("two").len(), 2);
        assert_eq!(transport.member_calls.load(Ordering::SeqCst), 2);
    }
}
