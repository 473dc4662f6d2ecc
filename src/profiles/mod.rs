//! Profile handover modules.
//!
//! Each module owns the connection registry of one Bluetooth profile and
//! implements [`ProfileHandover`](crate::handover::ProfileHandover) for it.

pub mod acl;
pub mod capability;
pub mod discovery;
pub mod obex;
pub mod remote;
pub mod scan;
pub mod serial;
pub mod stream;

use serde::Serialize;

use crate::codec::convert_repr;

/// Lifecycle of a profile channel.
#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum ChannelState {
   #[default]
   Idle = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 3,
}

impl ChannelState {
   /// Connecting and disconnecting channels can not be handed over.
   pub const fn is_transient(self) -> bool {
      matches!(self, Self::Connecting | Self::Disconnecting)
   }
}

convert_repr!(ChannelState);
