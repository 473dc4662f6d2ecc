//! Event handling for handover progress.
//!
//! This module provides the event infrastructure the coordinator uses to
//! report handover attempts: vetoes, transferred byte counts, commits and
//! aborts.

use std::sync::Arc;

use crate::{handover::ProfileId, peer::PeerIdentity};

/// Events emitted by the handover coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoverEvent {
   Vetoed(ProfileId),
   Marshalled { bytes: usize },
   Unmarshalled { bytes: usize },
   Committed { primary: bool },
   Completed { primary: bool },
   Aborted,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, peer: Option<&PeerIdentity>, event: HandoverEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
