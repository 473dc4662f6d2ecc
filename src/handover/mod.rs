//! Handover phase contract shared by every profile.
//!
//! A handover moves the authoritative copy of each profile's connection
//! state for one peer from the primary earbud to the secondary. Every
//! profile module implements the same six operations; the
//! [`coordinator::Coordinator`] drives them in global phase order:
//!
//! 1. `veto` on every profile; any `true` cancels the attempt.
//! 2. `marshal` on the primary, `unmarshal` on the secondary, per profile.
//! 3. `commit` on both sides once every transfer has succeeded.
//! 4. `complete` on both sides.
//!
//! Until the first commit an attempt can be cancelled with `abort`, which
//! must restore every connection the attempt touched.

pub mod coordinator;
pub mod rebind;
pub mod transfer;

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::{
   codec::Transfer,
   error::HandoverError,
   link::SharedLinkLayer,
   peer::PeerIdentity,
   runtime::{Scheduler, TaskId},
};

/// Identifies a profile module on the wire and in logs.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   PartialOrd,
   Ord,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ProfileId {
   Acl = 0x01,
   StreamControl = 0x02,
   RemoteControl = 0x03,
   ServiceDiscovery = 0x04,
   BroadcastScan = 0x05,
   ObjectExchange = 0x06,
   SerialPort = 0x07,
   AudioCapability = 0x08,
}

/// The six-operation handover contract.
///
/// All operations are synchronous and must not block. Only `marshal` and
/// `unmarshal` can fail, by returning a `Transfer` with `ok == false`.
pub trait ProfileHandover: Any + Send {
   fn id(&self) -> ProfileId;

   /// Returns true when the peer's connection is in a state that can not be
   /// handed over right now. Must not mutate state.
   fn veto(&self, peer: &PeerIdentity) -> bool;

   /// Writes the next window of the peer's snapshot. Called again with a
   /// fresh window until a call moves fewer bytes than the window holds.
   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer;

   /// Consumes the next window of the peer's snapshot, materializing
   /// connection instances once the snapshot is complete.
   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer;

   /// Acts on the new role. Infallible.
   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool);

   /// Releases transfer resources. Idempotent.
   fn complete(&mut self, becoming_primary: bool);

   /// Restores every connection touched by the current attempt.
   fn abort(&mut self);

   /// Takes the reason a decoded snapshot was refused, when `unmarshal`
   /// failed on well-formed bytes.
   fn take_rejection(&mut self) -> Option<HandoverError> {
      None
   }

   /// Snapshot of the module's live state for diagnostics.
   fn describe(&self) -> serde_json::Value;
}

/// Handles a profile module needs from its earbud.
#[derive(Clone)]
pub struct ProfileContext {
   pub task: TaskId,
   pub scheduler: Scheduler,
   pub links: SharedLinkLayer,
}

impl ProfileContext {
   pub fn new(task: TaskId, scheduler: Scheduler, links: SharedLinkLayer) -> Self {
      Self {
         task,
         scheduler,
         links,
      }
   }

   /// Whether this profile's task still has unprocessed messages for the peer.
   pub fn has_pending(&self, peer: &PeerIdentity) -> bool {
      self.scheduler.pending_for(self.task, peer)
   }
}

#[cfg(test)]
pub(crate) mod testing {
   //! Helpers shared by the profile tests.

   use std::sync::Arc;

   use parking_lot::Mutex;

   use super::*;
   use crate::{
      codec::Transfer,
      link::MemoryLinkLayer,
      peer::BdAddr,
   };

   pub type Links = Arc<Mutex<MemoryLinkLayer>>;

   pub fn peer() -> PeerIdentity {
      PeerIdentity::bredr(BdAddr::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]))
   }

   pub fn other_peer() -> PeerIdentity {
      PeerIdentity::bredr(BdAddr::new([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]))
   }

   pub fn context(task: TaskId) -> (ProfileContext, Links) {
      let links = MemoryLinkLayer::shared();
      let shared: SharedLinkLayer = links.clone();
      (ProfileContext::new(task, Scheduler::new(), shared), links)
   }

   /// Marshals the peer's whole snapshot through `window`-sized buffers.
   pub fn marshal_all(
      profile: &mut dyn ProfileHandover,
      peer: &PeerIdentity,
      window: usize,
   ) -> Vec<u8> {
      let mut out = Vec::new();
      loop {
         let mut buf = vec![0u8; window];
         let Transfer { bytes, ok } = profile.marshal(peer, &mut buf);
         assert!(ok, "marshal failed");
         out.extend_from_slice(&buf[..bytes]);
         if bytes < window {
            return out;
         }
      }
   }

   /// Feeds `bytes` in `window`-sized pieces, then an empty window.
   pub fn unmarshal_all(
      profile: &mut dyn ProfileHandover,
      peer: &PeerIdentity,
      bytes: &[u8],
      window: usize,
   ) -> bool {
      let mut consumed = 0;
      for chunk in bytes.chunks(window) {
         let t = profile.unmarshal(peer, chunk);
         if !t.ok {
            return false;
         }
         consumed += t.bytes;
      }
      let t = profile.unmarshal(peer, &[]);
      t.ok && consumed == bytes.len()
   }
}
