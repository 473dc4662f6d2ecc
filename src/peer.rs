//! Remote device identities.
//!
//! A peer is the phone (or other source) connected to the earbud pair. It is
//! identified by its Bluetooth device address together with the transport
//! the link runs over, so an LE and a BR/EDR link from the same device are
//! distinct peers.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
   codec::{Codec, Convert, Step},
   error::HandoverError,
};

/// A 48-bit Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
   pub const fn new(bytes: [u8; 6]) -> Self {
      Self(bytes)
   }

   pub const fn any() -> Self {
      Self([0; 6])
   }

   pub fn is_any(&self) -> bool {
      self.0 == [0; 6]
   }
}

impl fmt::Display for BdAddr {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for BdAddr {
   type Err = HandoverError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let mut bytes = [0u8; 6];
      let mut parts = s.split(':');
      for byte in &mut bytes {
         let part = parts
            .next()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| HandoverError::InvalidAddress(s.to_string()))?;
         *byte = u8::from_str_radix(part, 16)
            .map_err(|_| HandoverError::InvalidAddress(s.to_string()))?;
      }
      if parts.next().is_some() {
         return Err(HandoverError::InvalidAddress(s.to_string()));
      }
      Ok(Self(bytes))
   }
}

impl Serialize for BdAddr {
   fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for BdAddr {
   fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}

impl Convert for BdAddr {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      self.0.convert(codec)
   }
}

/// Link transport of a peer connection.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
   #[default]
   BrEdr = 0,
   Le = 1,
}

crate::codec::convert_repr!(Transport);

/// Identity of a remote device: address plus transport. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerIdentity {
   pub addr: BdAddr,
   pub transport: Transport,
}

impl PeerIdentity {
   pub const fn new(addr: BdAddr, transport: Transport) -> Self {
      Self { addr, transport }
   }

   pub const fn bredr(addr: BdAddr) -> Self {
      Self::new(addr, Transport::BrEdr)
   }

   pub const fn le(addr: BdAddr) -> Self {
      Self::new(addr, Transport::Le)
   }
}

impl fmt::Display for PeerIdentity {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}/{}", self.addr, self.transport)
   }
}

impl Convert for PeerIdentity {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      self.addr.convert(codec)?;
      self.transport.convert(codec)
   }
}
