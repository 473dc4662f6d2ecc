//! Error types for the handover core.
//!
//! This module defines the errors surfaced by the coordinator, the earbud
//! harness and the configuration layer. The per-profile phase operations
//! themselves report through `bool` vetoes and `Transfer` outcomes; these
//! errors are what the coordinator turns those outcomes into.

use thiserror::Error;

use crate::{handover::ProfileId, peer::PeerIdentity};

/// Main error type for the handover core.
#[derive(Error, Debug)]
pub enum HandoverError {
   #[error("Handover vetoed by {profile} for {peer}")]
   Vetoed {
      peer: PeerIdentity,
      profile: ProfileId,
   },

   #[error("Corrupt {profile} stream for {peer}")]
   Codec {
      peer: PeerIdentity,
      profile: ProfileId,
   },

   #[error("{profile} stream for {peer} has trailing bytes: consumed {consumed} of {expected}")]
   TrailingBytes {
      peer: PeerIdentity,
      profile: ProfileId,
      consumed: usize,
      expected: usize,
   },

   #[error("{profile} state for {peer} references a missing {parent}")]
   MissingParent {
      peer: PeerIdentity,
      profile: ProfileId,
      parent: &'static str,
   },

   #[error("Unknown profile id: 0x{0:02x}")]
   UnknownProfile(u8),

   #[error("Profile {0} appears twice in one blob")]
   DuplicateProfile(ProfileId),

   #[error("Malformed handover frame: {reason}")]
   MalformedFrame { reason: &'static str },

   #[error("Profile {profile} payload too large: {len} bytes")]
   FrameTooLarge { profile: ProfileId, len: usize },

   #[error("Handover phase violation: cannot {operation} while {phase}")]
   PhaseViolation {
      operation: &'static str,
      phase: &'static str,
   },

   #[error("Peer not connected: {0}")]
   PeerNotConnected(PeerIdentity),

   #[error("Connection table full")]
   RegistryFull,

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(String),

   #[error("Invalid configuration: {0}")]
   InvalidConfig(String),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `HandoverError`.
pub type Result<T> = std::result::Result<T, HandoverError>;
