//! Windowed transfer state shared by the profile modules.
//!
//! A profile hands its snapshot type to [`Transfers`], which keeps the
//! outbound snapshot captured at the first marshal call and the inbound
//! snapshot being decoded, each with its [`TransferCursor`]. The inbound
//! snapshot is staged: it is only applied to the profile's registry once the
//! last field has been decoded, so a stream that turns out to be corrupt
//! leaves the registry untouched.

use log::{debug, error, warn};

use crate::{
   codec::{Codec, Direction, Halt, Snapshot, Transfer, TransferCursor, convert_versioned},
   error::HandoverError,
   handover::ProfileId,
   peer::PeerIdentity,
};

struct Pending<S> {
   peer: PeerIdentity,
   cursor: TransferCursor,
   snapshot: S,
   finished: bool,
}

impl<S: Default> Pending<S> {
   fn new(peer: PeerIdentity, direction: Direction, snapshot: S) -> Self {
      Self {
         peer,
         cursor: TransferCursor::new(direction),
         snapshot,
         finished: false,
      }
   }
}

/// Outbound and inbound transfer of one profile.
pub struct Transfers<S> {
   outbound: Option<Pending<S>>,
   inbound: Option<Pending<S>>,
   rejected: Option<HandoverError>,
}

impl<S> Default for Transfers<S> {
   fn default() -> Self {
      Self {
         outbound: None,
         inbound: None,
         rejected: None,
      }
   }
}

impl<S: Snapshot> Transfers<S> {
   pub fn new() -> Self {
      Self::default()
   }

   /// Writes the next window of the peer's snapshot.
   ///
   /// `capture` runs once, on the first call for the peer; `None` means the
   /// profile holds nothing for the peer and the transfer is empty.
   pub fn marshal(
      &mut self,
      profile: ProfileId,
      peer: &PeerIdentity,
      window: &mut [u8],
      capture: impl FnOnce(&PeerIdentity) -> Option<S>,
   ) -> Transfer {
      if let Some(busy) = &self.outbound
         && busy.peer != *peer
         && !busy.finished
      {
         error!("{profile}: marshal for {peer} while {} is in progress", busy.peer);
         return Transfer::failed(0);
      }
      if self.outbound.as_ref().is_none_or(|p| p.peer != *peer) {
         let pending = match capture(peer) {
            Some(snapshot) => Pending::new(*peer, Direction::Serialize, snapshot),
            None => Pending {
               finished: true,
               ..Pending::new(*peer, Direction::Serialize, S::default())
            },
         };
         self.outbound = Some(pending);
      }
      let Some(pending) = self.outbound.as_mut() else {
         return Transfer::failed(0);
      };
      if pending.finished {
         return Transfer::done(0);
      }

      let mut codec = Codec::serializer(&mut pending.cursor, window);
      let step = convert_versioned(&mut codec, &mut pending.snapshot);
      let outcome = codec.outcome(step);
      match step {
         Ok(()) => pending.finished = true,
         Err(Halt::Exhausted) => {},
         Err(Halt::Corrupt) => error!("{profile}: marshal for {peer} failed"),
      }
      debug!(
         "{profile} → {peer}: {} bytes {}",
         outcome.bytes,
         hex::encode(&window[..outcome.bytes])
      );
      outcome
   }

   /// Consumes the next window of the peer's snapshot and, once the last
   /// field has arrived, hands the decoded snapshot to `apply`.
   pub fn unmarshal(
      &mut self,
      profile: ProfileId,
      peer: &PeerIdentity,
      window: &[u8],
      apply: impl FnOnce(&PeerIdentity, S) -> Result<(), HandoverError>,
   ) -> Transfer {
      if let Some(busy) = &self.inbound
         && busy.peer != *peer
         && !busy.finished
      {
         error!("{profile}: unmarshal for {peer} while {} is in progress", busy.peer);
         return Transfer::failed(0);
      }
      if self.inbound.as_ref().is_none_or(|p| p.peer != *peer) {
         self.inbound = Some(Pending::new(*peer, Direction::Deserialize, S::default()));
      }
      let Some(pending) = self.inbound.as_mut() else {
         return Transfer::failed(0);
      };
      if pending.finished {
         return Transfer::done(0);
      }

      let mut codec = Codec::deserializer(&mut pending.cursor, window);
      let step = convert_versioned(&mut codec, &mut pending.snapshot);
      let outcome = codec.outcome(step);
      debug!(
         "{profile} ← {peer}: {} bytes {}",
         outcome.bytes,
         hex::encode(&window[..outcome.bytes])
      );
      match step {
         Ok(()) => {
            pending.finished = true;
            let snapshot = std::mem::take(&mut pending.snapshot);
            if let Err(e) = apply(peer, snapshot) {
               error!("{profile}: applying state for {peer} failed: {e}");
               self.rejected = Some(e);
               return Transfer::failed(outcome.bytes);
            }
            outcome
         },
         Err(Halt::Exhausted) => outcome,
         Err(Halt::Corrupt) => {
            warn!("{profile}: corrupt stream from {peer}");
            outcome
         },
      }
   }

   /// Peer of the unfinished outbound transfer, if any.
   pub fn marshalling(&self) -> Option<PeerIdentity> {
      self
         .outbound
         .as_ref()
         .filter(|p| !p.finished)
         .map(|p| p.peer)
   }

   /// Why the last decoded snapshot could not be applied.
   pub fn take_rejection(&mut self) -> Option<HandoverError> {
      self.rejected.take()
   }

   pub fn is_idle(&self) -> bool {
      self.outbound.is_none() && self.inbound.is_none()
   }

   /// Drops both transfers and their cursors.
   pub fn clear(&mut self) {
      self.outbound = None;
      self.inbound = None;
      self.rejected = None;
   }
}
