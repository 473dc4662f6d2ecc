//! Primary/secondary role handover for a true-wireless earbud pair.
//!
//! Each Bluetooth profile captures its live per-connection state into a byte
//! stream, ships it to the other earbud, reconstructs it there, and the pair
//! atomically switches which earbud is authoritative.

pub mod codec;
pub mod config;
pub mod earbud;
pub mod error;
pub mod event;
pub mod handover;
pub mod link;
pub mod peer;
pub mod profiles;
pub mod registry;
pub mod runtime;
