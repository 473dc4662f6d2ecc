//! Link-layer stream primitives consumed at commit time.
//!
//! The radio transport and channel framing live outside this crate. What the
//! handover needs from them is small: find the stream carrying a given
//! channel for a peer, move its ownership to a task, mark whether it may be
//! handed over, and connect its data path to a destination. [`LinkLayer`]
//! captures exactly that; [`MemoryLinkLayer`] is the in-process
//! implementation used by the earbud harness and the tests.

use std::{collections::BTreeMap, fmt, sync::Arc};

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::{peer::PeerIdentity, runtime::TaskId};

/// Opaque handle of a stream on the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "stream#{}", self.0)
   }
}

/// Transport channel a stream is carried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Channel {
   /// L2CAP channel id.
   L2cap(u16),
   /// RFCOMM data link connection id.
   Rfcomm(u8),
   /// ATT bearer channel id.
   Att(u16),
}

impl fmt::Display for Channel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::L2cap(cid) => write!(f, "l2cap:0x{cid:04x}"),
         Self::Rfcomm(dlci) => write!(f, "rfcomm:{dlci}"),
         Self::Att(cid) => write!(f, "att:0x{cid:04x}"),
      }
   }
}

/// Whether the link layer may hand a stream over to the other earbud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
pub enum HandoverPolicy {
   #[default]
   Disallow,
   Allow,
}

/// Where the data of a stream goes once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Destination {
   /// Incoming data is discarded.
   Dispose,
   /// Incoming data feeds the audio path.
   AudioPath,
   /// Incoming data is delivered to a task.
   Task(TaskId),
}

/// Failures while rebinding a stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebindError {
   #[error("No stream for {peer} on {channel}")]
   NoStream {
      peer: PeerIdentity,
      channel: Channel,
   },

   #[error("Unknown {0}")]
   UnknownStream(StreamId),
}

/// Link-layer operations used by profile commits.
pub trait LinkLayer {
   /// Looks up the stream carrying `channel` for the peer.
   fn stream(&self, peer: &PeerIdentity, channel: Channel) -> Option<StreamId>;

   /// Moves ownership of the stream to `task`.
   fn rebind(&mut self, stream: StreamId, task: TaskId) -> Result<(), RebindError>;

   fn set_handover_policy(
      &mut self,
      stream: StreamId,
      policy: HandoverPolicy,
   ) -> Result<(), RebindError>;

   fn handover_policy(&self, stream: StreamId) -> Option<HandoverPolicy>;

   /// Connects the stream's data path to `destination`.
   fn connect(&mut self, stream: StreamId, destination: Destination) -> Result<(), RebindError>;
}

/// Shared handle to a link layer.
pub type SharedLinkLayer = Arc<Mutex<dyn LinkLayer + Send>>;

/// State the link layer keeps for one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamBinding {
   pub peer: PeerIdentity,
   pub channel: Channel,
   pub owner: Option<TaskId>,
   pub policy: HandoverPolicy,
   pub destination: Option<Destination>,
}

/// In-process link layer.
#[derive(Debug, Default)]
pub struct MemoryLinkLayer {
   streams: BTreeMap<StreamId, StreamBinding>,
   next_id: u32,
}

impl MemoryLinkLayer {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn shared() -> Arc<Mutex<Self>> {
      Arc::new(Mutex::new(Self::new()))
   }

   /// Opens a stream for the peer, owned by `owner`.
   pub fn open(&mut self, peer: PeerIdentity, channel: Channel, owner: TaskId) -> StreamId {
      self.next_id += 1;
      let id = StreamId(self.next_id);
      debug!("{id} opened for {peer} on {channel}");
      self.streams.insert(
         id,
         StreamBinding {
            peer,
            channel,
            owner: Some(owner),
            policy: HandoverPolicy::Disallow,
            destination: Some(Destination::Task(owner)),
         },
      );
      id
   }

   pub fn close(&mut self, peer: &PeerIdentity, channel: Channel) -> Option<StreamBinding> {
      let id = self.stream(peer, channel)?;
      self.streams.remove(&id)
   }

   /// Takes over every stream of the peer from `other`, as the radio does
   /// when the earbuds swap roles. Adopted streams get fresh ids and no
   /// owner until a commit rebinds them.
   pub fn adopt(&mut self, other: &mut Self, peer: &PeerIdentity) -> usize {
      let moved: Vec<_> = other
         .streams
         .iter()
         .filter(|(_, b)| &b.peer == peer)
         .map(|(id, _)| *id)
         .collect();
      for id in &moved {
         if let Some(binding) = other.streams.remove(id) {
            self.next_id += 1;
            self.streams.insert(
               StreamId(self.next_id),
               StreamBinding {
                  owner: None,
                  policy: HandoverPolicy::Disallow,
                  destination: None,
                  ..binding
               },
            );
         }
      }
      moved.len()
   }

   pub fn binding(&self, stream: StreamId) -> Option<&StreamBinding> {
      self.streams.get(&stream)
   }

   pub fn streams_for(&self, peer: &PeerIdentity) -> Vec<(StreamId, StreamBinding)> {
      self
         .streams
         .iter()
         .filter(|(_, b)| &b.peer == peer)
         .map(|(id, b)| (*id, b.clone()))
         .collect()
   }

   pub fn len(&self) -> usize {
      self.streams.len()
   }

   pub fn is_empty(&self) -> bool {
      self.streams.is_empty()
   }

   fn binding_mut(&mut self, stream: StreamId) -> Result<&mut StreamBinding, RebindError> {
      self
         .streams
         .get_mut(&stream)
         .ok_or(RebindError::UnknownStream(stream))
   }
}

impl LinkLayer for MemoryLinkLayer {
   fn stream(&self, peer: &PeerIdentity, channel: Channel) -> Option<StreamId> {
      self
         .streams
         .iter()
         .find(|(_, b)| &b.peer == peer && b.channel == channel)
         .map(|(id, _)| *id)
   }

   fn rebind(&mut self, stream: StreamId, task: TaskId) -> Result<(), RebindError> {
      self.binding_mut(stream)?.owner = Some(task);
      Ok(())
   }

   fn set_handover_policy(
      &mut self,
      stream: StreamId,
      policy: HandoverPolicy,
   ) -> Result<(), RebindError> {
      self.binding_mut(stream)?.policy = policy;
      Ok(())
   }

   fn handover_policy(&self, stream: StreamId) -> Option<HandoverPolicy> {
      self.streams.get(&stream).map(|b| b.policy)
   }

   fn connect(&mut self, stream: StreamId, destination: Destination) -> Result<(), RebindError> {
      self.binding_mut(stream)?.destination = Some(destination);
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::peer::BdAddr;

   #[test]
   fn test_adopt_moves_streams_unbound() {
      let peer = PeerIdentity::bredr(BdAddr::new([9; 6]));
      let other = PeerIdentity::bredr(BdAddr::new([8; 6]));
      let mut primary = MemoryLinkLayer::new();
      let mut secondary = MemoryLinkLayer::new();

      let sig = primary.open(peer, Channel::L2cap(0x40), TaskId::StreamControl);
      primary
         .set_handover_policy(sig, HandoverPolicy::Allow)
         .unwrap();
      primary.open(other, Channel::L2cap(0x41), TaskId::StreamControl);

      assert_eq!(secondary.adopt(&mut primary, &peer), 1);
      assert_eq!(primary.len(), 1);
      assert!(primary.stream(&peer, Channel::L2cap(0x40)).is_none());

      let id = secondary.stream(&peer, Channel::L2cap(0x40)).unwrap();
      let binding = secondary.binding(id).unwrap();
      assert_eq!(binding.owner, None);
      assert_eq!(binding.policy, HandoverPolicy::Disallow);
      assert_eq!(binding.destination, None);
   }

   #[test]
   fn test_unknown_stream_is_rejected() {
      let mut link = MemoryLinkLayer::new();
      assert_eq!(
         link.rebind(StreamId(42), TaskId::Application),
         Err(RebindError::UnknownStream(StreamId(42)))
      );
      assert_eq!(link.handover_policy(StreamId(42)), None);
   }
}
