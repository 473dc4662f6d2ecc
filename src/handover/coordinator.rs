//! Drives every registered profile through a handover attempt.
//!
//! The coordinator owns the profile modules of one earbud and enforces the
//! global phase order: all vetoes before any transfer, every transfer before
//! any commit, and no abort once something has committed.
//!
//! Marshalled state for a peer travels between earbuds as one blob made of
//! per-profile frames:
//!
//! ```text
//! [profile id: u8][payload length: u16 LE][payload]
//! ```
//!
//! Profiles with nothing to transfer for the peer contribute no frame. Each
//! payload is produced and consumed through `window_size`-byte windows.

use std::any::Any;

use log::{debug, info, warn};
use serde_json::{Map, Value};

use crate::{
   error::{HandoverError, Result},
   event::{EventSender, HandoverEvent},
   handover::{ProfileHandover, ProfileId},
   peer::PeerIdentity,
};

/// Default transfer window in bytes.
pub const DEFAULT_WINDOW: usize = 64;
/// Smallest window a coordinator accepts.
pub const MIN_WINDOW: usize = 8;

const FRAME_HEADER: usize = 3;

/// Where the coordinator is within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
   Idle,
   /// Every profile agreed; transfers may start.
   Cleared,
   Transferring,
   /// At least one profile committed; the attempt must be completed.
   Committed,
}

/// Handover coordinator of one earbud.
pub struct Coordinator {
   profiles: Vec<Box<dyn ProfileHandover>>,
   window_size: usize,
   phase: Phase,
   events: Option<EventSender>,
}

impl Coordinator {
   pub fn new(window_size: usize) -> Self {
      Self {
         profiles: Vec::new(),
         window_size: window_size.max(MIN_WINDOW),
         phase: Phase::Idle,
         events: None,
      }
   }

   pub fn with_events(mut self, events: EventSender) -> Self {
      self.events = Some(events);
      self
   }

   /// Adds a profile module. A second module with the same id replaces the
   /// first.
   pub fn register(&mut self, profile: Box<dyn ProfileHandover>) {
      let id = profile.id();
      if let Some(slot) = self.profiles.iter_mut().find(|p| p.id() == id) {
         warn!("Profile {id} registered twice, replacing");
         *slot = profile;
      } else {
         self.profiles.push(profile);
      }
   }

   pub const fn phase(&self) -> Phase {
      self.phase
   }

   pub const fn window_size(&self) -> usize {
      self.window_size
   }

   /// Typed access to a registered profile module.
   pub fn profile<P: ProfileHandover>(&self) -> Option<&P> {
      self
         .profiles
         .iter()
         .find_map(|p| (&**p as &dyn Any).downcast_ref::<P>())
   }

   pub fn profile_mut<P: ProfileHandover>(&mut self) -> Option<&mut P> {
      self
         .profiles
         .iter_mut()
         .find_map(|p| (&mut **p as &mut dyn Any).downcast_mut::<P>())
   }

   fn emit(&self, peer: Option<&PeerIdentity>, event: HandoverEvent) {
      if let Some(events) = &self.events {
         events.emit(peer, event);
      }
   }

   fn require(&self, operation: &'static str, allowed: &[Phase]) -> Result<()> {
      if allowed.contains(&self.phase) {
         Ok(())
      } else {
         Err(HandoverError::PhaseViolation {
            operation,
            phase: self.phase.into(),
         })
      }
   }

   /// Asks every profile whether the peers can be handed over now.
   pub fn veto(&mut self, peers: &[PeerIdentity]) -> Result<()> {
      self.require("veto", &[Phase::Idle, Phase::Cleared])?;
      for peer in peers {
         if let Some(profile) = self.profiles.iter().find(|p| p.veto(peer)) {
            let profile = profile.id();
            info!("Handover of {peer} vetoed by {profile}");
            self.emit(Some(peer), HandoverEvent::Vetoed(profile));
            self.phase = Phase::Idle;
            return Err(HandoverError::Vetoed {
               peer: *peer,
               profile,
            });
         }
      }
      self.phase = Phase::Cleared;
      Ok(())
   }

   /// Marshals every profile's state for the peer into one blob.
   pub fn marshal(&mut self, peer: &PeerIdentity) -> Result<Vec<u8>> {
      self.require("marshal", &[Phase::Cleared, Phase::Transferring])?;
      self.phase = Phase::Transferring;

      let mut blob = Vec::new();
      let mut window = vec![0u8; self.window_size];
      for profile in &mut self.profiles {
         let id = profile.id();
         let mut payload = Vec::new();
         loop {
            let transfer = profile.marshal(peer, &mut window);
            if !transfer.ok {
               return Err(HandoverError::Codec {
                  peer: *peer,
                  profile: id,
               });
            }
            payload.extend_from_slice(&window[..transfer.bytes]);
            if transfer.bytes < window.len() {
               break;
            }
         }
         if payload.is_empty() {
            continue;
         }
         let len = u16::try_from(payload.len()).map_err(|_| HandoverError::FrameTooLarge {
            profile: id,
            len: payload.len(),
         })?;
         debug!("{id}: {} bytes for {peer}", payload.len());
         blob.push(id as u8);
         blob.extend_from_slice(&len.to_le_bytes());
         blob.extend_from_slice(&payload);
      }

      info!("Marshalled {} bytes for {peer}", blob.len());
      self.emit(Some(peer), HandoverEvent::Marshalled { bytes: blob.len() });
      Ok(blob)
   }

   /// Feeds a blob produced by the other earbud's `marshal` to the profiles.
   pub fn unmarshal(&mut self, peer: &PeerIdentity, blob: &[u8]) -> Result<()> {
      self.require(
         "unmarshal",
         &[Phase::Idle, Phase::Cleared, Phase::Transferring],
      )?;
      self.phase = Phase::Transferring;

      let mut seen: Vec<ProfileId> = Vec::new();
      let mut rest = blob;
      while !rest.is_empty() {
         let [raw_id, lo, hi, tail @ ..] = rest else {
            return Err(HandoverError::MalformedFrame {
               reason: "truncated header",
            });
         };
         let id = ProfileId::from_repr(*raw_id).ok_or(HandoverError::UnknownProfile(*raw_id))?;
         let len = usize::from(u16::from_le_bytes([*lo, *hi]));
         if tail.len() < len {
            return Err(HandoverError::MalformedFrame {
               reason: "payload shorter than its length",
            });
         }
         if seen.contains(&id) {
            return Err(HandoverError::DuplicateProfile(id));
         }
         seen.push(id);
         let (payload, next) = tail.split_at(len);
         rest = next;

         let window_size = self.window_size;
         let profile = self
            .profiles
            .iter_mut()
            .find(|p| p.id() == id)
            .ok_or(HandoverError::UnknownProfile(*raw_id))?;
         feed(profile.as_mut(), peer, payload, window_size)?;
      }

      info!("Unmarshalled {} bytes for {peer}", blob.len());
      self.emit(Some(peer), HandoverEvent::Unmarshalled { bytes: blob.len() });
      Ok(())
   }

   /// Commits the peer on every profile.
   pub fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) -> Result<()> {
      self.require(
         "commit",
         &[Phase::Cleared, Phase::Transferring, Phase::Committed],
      )?;
      self.phase = Phase::Committed;
      for profile in &mut self.profiles {
         profile.commit(peer, becoming_primary);
      }
      info!("Committed {peer} as {}", role(becoming_primary));
      self.emit(Some(peer), HandoverEvent::Committed {
         primary: becoming_primary,
      });
      Ok(())
   }

   /// Finishes the attempt. Safe to call more than once.
   pub fn complete(&mut self, becoming_primary: bool) {
      for profile in &mut self.profiles {
         profile.complete(becoming_primary);
      }
      if self.phase != Phase::Idle {
         info!("Handover complete, now {}", role(becoming_primary));
         self.emit(None, HandoverEvent::Completed {
            primary: becoming_primary,
         });
      }
      self.phase = Phase::Idle;
   }

   /// Cancels the attempt, restoring every profile. Refused after a commit.
   pub fn abort(&mut self) -> Result<()> {
      self.require(
         "abort",
         &[Phase::Idle, Phase::Cleared, Phase::Transferring],
      )?;
      for profile in &mut self.profiles {
         profile.abort();
      }
      if self.phase != Phase::Idle {
         warn!("Handover aborted");
         self.emit(None, HandoverEvent::Aborted);
      }
      self.phase = Phase::Idle;
      Ok(())
   }

   /// Live state of every profile, keyed by profile name.
   pub fn describe(&self) -> Value {
      let mut map = Map::new();
      for profile in &self.profiles {
         map.insert(profile.id().to_string(), profile.describe());
      }
      Value::Object(map)
   }
}

fn feed(
   profile: &mut dyn ProfileHandover,
   peer: &PeerIdentity,
   payload: &[u8],
   window_size: usize,
) -> Result<()> {
   let id = profile.id();
   let corrupt = || HandoverError::Codec { peer: *peer, profile: id };

   let mut consumed = 0;
   for window in payload.chunks(window_size) {
      let transfer = profile.unmarshal(peer, window);
      if !transfer.ok {
         return Err(profile.take_rejection().unwrap_or_else(corrupt));
      }
      consumed += transfer.bytes;
   }
   // an empty window either confirms the snapshot is complete or exposes a
   // stream that ended early
   if !profile.unmarshal(peer, &[]).ok {
      return Err(profile.take_rejection().unwrap_or_else(corrupt));
   }
   if consumed != payload.len() {
      return Err(HandoverError::TrailingBytes {
         peer: *peer,
         profile: id,
         consumed,
         expected: payload.len(),
      });
   }
   Ok(())
}

const fn role(primary: bool) -> &'static str {
   if primary { "primary" } else { "secondary" }
}
