//! Async orchestration layer for the syncline chat SDK core.
//!
//! Builds the session-level machinery on top of `syncline-core`: the
//! pagination controller, read-state reconciliation, the coalesced member
//! loader, the resilient delivery manager, and the session facade that
//! ties them to a transport and a store.

/// Resilient delivery with retry, backoff and escalation hooks.
pub mod delivery;
/// Coalesced full member-list loading.
pub mod members;
/// History pagination with pending-token discipline.
pub mod pagination;
/// Read marker and receipt reconciliation.
pub mod read_state;
/// The session facade.
pub mod session;
/// Collaborator traits (transport, store, hooks).
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use delivery::{DeliveryManager, DeliveryState, OperationId};
pub use members::MemberLoader;
pub use pagination::{PaginationController, PaginationKind, PaginationState};
pub use read_state::{is_valid_event_id, ReadStateManager};
pub use session::SyncSession;
pub use traits::{EncryptionHook, NoopHooks, SessionHooks, Store, Transport};
