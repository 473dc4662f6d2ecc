//! Connection manager: the baseband link itself.
//!
//! Holds per-peer ACL parameters (role, power mode, link policy, supervision
//! timeout, negotiated features) that the new primary needs before any
//! profile channel on top of the link can be used.

use log::{debug, info};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
   codec::{Codec, Convert, Snapshot, Step, Transfer, convert_repr},
   error::HandoverError,
   handover::{ProfileContext, ProfileHandover, ProfileId, transfer::Transfers},
   peer::PeerIdentity,
   registry::Registry,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AclState {
   #[default]
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 3,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LinkRole {
   #[default]
   Central = 0,
   Peripheral = 1,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PowerMode {
   #[default]
   Active = 0,
   Hold = 1,
   Sniff = 2,
   Park = 3,
}

convert_repr!(AclState, LinkRole, PowerMode);

/// Connection parameters of an LE link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LeParams {
   pub interval: u16,
   pub latency: u16,
   pub timeout: u16,
   pub phy: u8,
}

impl Convert for LeParams {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.interval)?;
      codec.convert(&mut self.latency)?;
      codec.convert(&mut self.timeout)?;
      codec.convert(&mut self.phy)
   }
}

/// Transferable state of one ACL link.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AclParams {
   pub state: AclState,
   pub role: LinkRole,
   pub mode: PowerMode,
   pub link_policy: u16,
   pub supervision_timeout: u16,
   pub sniff_interval: u16,
   pub remote_features: [u8; 8],
   pub class_of_device: u32,
   pub encrypted: bool,
   pub le: Option<LeParams>,
}

impl Convert for AclParams {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.state)?;
      codec.convert(&mut self.role)?;
      codec.convert(&mut self.mode)?;
      codec.convert(&mut self.link_policy)?;
      codec.convert(&mut self.supervision_timeout)?;
      codec.convert(&mut self.sniff_interval)?;
      codec.convert(&mut self.remote_features)?;
      codec.convert(&mut self.class_of_device)?;
      codec.convert(&mut self.encrypted)?;
      codec.convert(&mut self.le)
   }
}

impl Snapshot for AclParams {
   const SCHEMA: u8 = 1;
}

#[derive(Debug, Clone, Default)]
pub struct AclLink {
   pub params: AclParams,
   /// Pairing or encryption procedure running on the link.
   pub security_pending: bool,
}

/// Connection manager handover module.
pub struct ConnectionManager {
   ctx: ProfileContext,
   links: Registry<AclLink>,
   transfers: Transfers<AclParams>,
}

impl ConnectionManager {
   pub fn new(ctx: ProfileContext) -> Self {
      Self {
         ctx,
         links: Registry::new(),
         transfers: Transfers::new(),
      }
   }

   /// Records an established link.
   pub fn connected(&mut self, peer: PeerIdentity, params: AclParams) -> Result<(), HandoverError> {
      self.links.insert(peer, (), AclLink {
         params: AclParams {
            state: AclState::Connected,
            ..params
         },
         security_pending: false,
      })?;
      info!("ACL up for {peer}");
      Ok(())
   }

   pub fn disconnected(&mut self, peer: &PeerIdentity) {
      if self.links.remove(peer, ()).is_some() {
         info!("ACL down for {peer}");
      }
   }

   pub fn set_security_pending(&mut self, peer: &PeerIdentity, pending: bool) {
      if let Some(link) = self.links.find_link_mut(peer, ()) {
         link.security_pending = pending;
      }
   }

   pub fn link(&self, peer: &PeerIdentity) -> Option<&AclParams> {
      self.links.find(peer).map(|l| &l.params)
   }

   pub fn peers(&self) -> impl Iterator<Item = PeerIdentity> + '_ {
      self.links.iter().map(|e| e.peer)
   }
}

impl ProfileHandover for ConnectionManager {
   fn id(&self) -> ProfileId {
      ProfileId::Acl
   }

   fn veto(&self, peer: &PeerIdentity) -> bool {
      let Some(link) = self.links.find(peer) else {
         // nothing to move
         return false;
      };
      if link.params.state != AclState::Connected {
         debug!("acl: {peer} is {}", link.params.state);
         return true;
      }
      if link.security_pending {
         debug!("acl: security procedure running on {peer}");
         return true;
      }
      self.ctx.has_pending(peer)
   }

   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer {
      let links = &self.links;
      self.transfers.marshal(ProfileId::Acl, peer, window, |p| {
         links.find(p).map(|l| l.params.clone())
      })
   }

   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer {
      self.transfers.unmarshal(ProfileId::Acl, peer, window, |p, params| {
         let link = self.links.allocate_if_absent(*p, ())?;
         link.params = params;
         link.security_pending = false;
         Ok(())
      })
   }

   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) {
      if becoming_primary {
         debug!("acl: {peer} now local");
      } else if self.links.remove(peer, ()).is_some() {
         // the link now lives on the other earbud
         debug!("acl: released {peer}");
      }
   }

   fn complete(&mut self, _becoming_primary: bool) {
      self.links.settle();
      self.transfers.clear();
   }

   fn abort(&mut self) {
      self.links.rollback();
      self.transfers.clear();
   }

   fn take_rejection(&mut self) -> Option<HandoverError> {
      self.transfers.take_rejection()
   }

   fn describe(&self) -> Value {
      let links: Vec<_> = self
         .links
         .iter()
         .map(|e| {
            json!({
               "peer": e.peer.to_string(),
               "state": e.conn.params.state.to_string(),
               "role": e.conn.params.role.to_string(),
               "mode": e.conn.params.mode.to_string(),
               "encrypted": e.conn.params.encrypted,
               "le": e.conn.params.le.is_some(),
            })
         })
         .collect();
      json!(links)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      handover::testing,
      runtime::{Message, MessageKind, TaskId},
   };

   fn params() -> AclParams {
      AclParams {
         role: LinkRole::Peripheral,
         mode: PowerMode::Sniff,
         link_policy: 0x0005,
         supervision_timeout: 0x1F40,
         sniff_interval: 0x0320,
         remote_features: [0xFF, 0xFE, 0x8F, 0xFE, 0xD8, 0x3F, 0x5B, 0x87],
         class_of_device: 0x24_0404,
         encrypted: true,
         le: None,
         ..Default::default()
      }
   }

   fn manager() -> ConnectionManager {
      let (ctx, _) = testing::context(TaskId::ConnectionManager);
      ConnectionManager::new(ctx)
   }

   #[test]
   fn test_roundtrip_through_small_windows() {
      let peer = testing::peer();
      let mut primary = manager();
      primary.connected(peer, params()).unwrap();
      let bytes = testing::marshal_all(&mut primary, &peer, 5);

      let mut secondary = manager();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 7));
      assert_eq!(secondary.link(&peer), primary.link(&peer));
      assert_eq!(secondary.link(&peer).unwrap().state, AclState::Connected);
   }

   #[test]
   fn test_le_parameters_survive() {
      let peer = PeerIdentity::le(testing::peer().addr);
      let mut primary = manager();
      primary
         .connected(peer, AclParams {
            le: Some(LeParams {
               interval: 24,
               latency: 0,
               timeout: 500,
               phy: 2,
            }),
            ..params()
         })
         .unwrap();
      let bytes = testing::marshal_all(&mut primary, &peer, 64);
      let mut secondary = manager();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 64));
      assert_eq!(secondary.link(&peer).unwrap().le.unwrap().timeout, 500);
   }

   #[test]
   fn test_veto_conditions() {
      let peer = testing::peer();
      let mut acl = manager();
      assert!(!acl.veto(&peer));

      acl.connected(peer, params()).unwrap();
      assert!(!acl.veto(&peer));

      acl.set_security_pending(&peer, true);
      assert!(acl.veto(&peer));
      acl.set_security_pending(&peer, false);

      acl
         .ctx
         .scheduler
         .post(TaskId::ConnectionManager, Message::for_peer(peer, MessageKind::ModeChange));
      assert!(acl.veto(&peer));
      acl.ctx.scheduler.pop(TaskId::ConnectionManager);
      assert!(!acl.veto(&peer));
   }

   #[test]
   fn test_secondary_commit_releases_link() {
      let peer = testing::peer();
      let mut acl = manager();
      acl.connected(peer, params()).unwrap();
      acl.commit(&peer, false);
      assert!(acl.link(&peer).is_none());
      acl.complete(false);
      acl.complete(false);
      assert!(acl.link(&peer).is_none());
   }

   #[test]
   fn test_abort_restores_prior_link() {
      let peer = testing::peer();
      let mut primary = manager();
      primary.connected(peer, params()).unwrap();
      let bytes = testing::marshal_all(&mut primary, &peer, 64);

      let mut secondary = manager();
      secondary
         .connected(peer, AclParams {
            mode: PowerMode::Active,
            ..params()
         })
         .unwrap();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 64));
      assert_eq!(secondary.link(&peer).unwrap().mode, PowerMode::Sniff);

      secondary.abort();
      assert_eq!(secondary.link(&peer).unwrap().mode, PowerMode::Active);
   }
}
