//! Object exchange sessions for message access and phonebook access.

use log::{debug, error, info};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
   codec::{Codec, Convert, Snapshot, Step, Transfer, convert_repr},
   error::{HandoverError, Result},
   handover::{
      ProfileContext, ProfileHandover, ProfileId, rebind::rebind_to_task, transfer::Transfers,
   },
   link::Channel,
   peer::PeerIdentity,
   profiles::ChannelState,
   registry::Registry,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ObexService {
   #[default]
   MessageAccess = 0,
   PhonebookAccess = 1,
}

convert_repr!(ObexService);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
   Get,
   Put,
   SetPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ObexSession {
   pub state: ChannelState,
   pub cid: u16,
   pub max_packet: u16,
   pub connection_id: u32,
   /// Single response mode negotiated.
   pub srm: bool,
   pub folder: heapless::Vec<u8, 32>,
   #[serde(skip)]
   pub operation: Option<Operation>,
}

impl Convert for ObexSession {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.state)?;
      codec.convert(&mut self.cid)?;
      codec.convert(&mut self.max_packet)?;
      codec.convert(&mut self.connection_id)?;
      codec.convert(&mut self.srm)?;
      codec.convert(&mut self.folder)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObexSessionSnapshot {
   pub service: ObexService,
   pub session: ObexSession,
}

impl Convert for ObexSessionSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.service)?;
      codec.convert(&mut self.session)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObexSnapshot {
   pub sessions: heapless::Vec<ObexSessionSnapshot, 2>,
}

impl Convert for ObexSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.sessions)
   }
}

impl Snapshot for ObexSnapshot {
   const SCHEMA: u8 = 1;
}

pub struct ObjectExchange {
   ctx: ProfileContext,
   sessions: Registry<ObexSession, ObexService>,
   transfers: Transfers<ObexSnapshot>,
}

impl ObjectExchange {
   pub fn new(ctx: ProfileContext) -> Self {
      Self {
         ctx,
         sessions: Registry::new(),
         transfers: Transfers::new(),
      }
   }

   pub fn session_connected(
      &mut self,
      peer: PeerIdentity,
      service: ObexService,
      cid: u16,
      max_packet: u16,
      connection_id: u32,
   ) -> Result<()> {
      self.sessions.insert(peer, service, ObexSession {
         state: ChannelState::Connected,
         cid,
         max_packet,
         connection_id,
         srm: true,
         ..Default::default()
      })?;
      info!("{service} session 0x{connection_id:08x} up for {peer}");
      Ok(())
   }

   pub fn set_folder(&mut self, peer: &PeerIdentity, service: ObexService, folder: &str) {
      if let Some(session) = self.sessions.find_link_mut(peer, service) {
         let bytes = &folder.as_bytes()[..folder.len().min(session.folder.capacity())];
         session.folder.clear();
         let _ = session.folder.extend_from_slice(bytes);
      }
   }

   pub fn begin(&mut self, peer: &PeerIdentity, service: ObexService, operation: Operation) {
      if let Some(session) = self.sessions.find_link_mut(peer, service) {
         session.operation = Some(operation);
      }
   }

   pub fn finish(&mut self, peer: &PeerIdentity, service: ObexService) {
      if let Some(session) = self.sessions.find_link_mut(peer, service) {
         session.operation = None;
      }
   }

   pub fn disconnected(&mut self, peer: &PeerIdentity) {
      self.sessions.remove_peer(peer);
   }

   pub fn session(&self, peer: &PeerIdentity, service: ObexService) -> Option<&ObexSession> {
      self.sessions.find_link(peer, service)
   }
}

impl ProfileHandover for ObjectExchange {
   fn id(&self) -> ProfileId {
      ProfileId::ObjectExchange
   }

   fn veto(&self, peer: &PeerIdentity) -> bool {
      for (service, session) in self.sessions.links(peer) {
         if session.state.is_transient() {
            debug!("obex: {service} session of {peer} is {}", session.state);
            return true;
         }
         if let Some(operation) = session.operation {
            debug!("obex: {operation} in flight on {service} for {peer}");
            return true;
         }
      }
      self.ctx.has_pending(peer)
   }

   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer {
      let sessions = &self.sessions;
      self
         .transfers
         .marshal(ProfileId::ObjectExchange, peer, window, |p| {
            let mut snapshot = ObexSnapshot::default();
            for (service, session) in sessions.links(p) {
               let _ = snapshot.sessions.push(ObexSessionSnapshot {
                  service,
                  session: ObexSession {
                     operation: None,
                     ..session.clone()
                  },
               });
            }
            (!snapshot.sessions.is_empty()).then_some(snapshot)
         })
   }

   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer {
      let sessions = &mut self.sessions;
      self
         .transfers
         .unmarshal(ProfileId::ObjectExchange, peer, window, |p, snapshot| {
            for entry in &snapshot.sessions {
               *sessions.allocate_if_absent(*p, entry.service)? = entry.session.clone();
            }
            sessions.retain_links(p, |service| {
               snapshot.sessions.iter().any(|s| s.service == *service)
            });
            Ok(())
         })
   }

   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) {
      if !becoming_primary {
         let released = self.sessions.remove_peer(peer);
         debug!("obex: released {released} session(s) of {peer}");
         return;
      }
      let channels: Vec<_> = self
         .sessions
         .links(peer)
         .map(|(service, s)| (service, s.cid))
         .collect();
      for (service, cid) in channels {
         if let Err(e) = rebind_to_task(&self.ctx, peer, Channel::L2cap(cid)) {
            error!("obex: {service} session of {peer} lost at commit: {e}");
            self.sessions.remove(peer, service);
         }
      }
   }

   fn complete(&mut self, _becoming_primary: bool) {
      self.sessions.settle();
      self.transfers.clear();
   }

   fn abort(&mut self) {
      self.sessions.rollback();
      self.transfers.clear();
   }

   fn take_rejection(&mut self) -> Option<HandoverError> {
      self.transfers.take_rejection()
   }

   fn describe(&self) -> Value {
      let sessions: Vec<_> = self
         .sessions
         .iter()
         .map(|e| {
            json!({
               "peer": e.peer.to_string(),
               "service": e.link.to_string(),
               "connection_id": format!("0x{:08x}", e.conn.connection_id),
               "folder": String::from_utf8_lossy(&e.conn.folder),
               "srm": e.conn.srm,
            })
         })
         .collect();
      json!(sessions)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{handover::testing, link::LinkLayer, runtime::TaskId};

   fn obex() -> (ObjectExchange, testing::Links) {
      let (ctx, links) = testing::context(TaskId::ObjectExchange);
      (ObjectExchange::new(ctx), links)
   }

   fn connected(peer: PeerIdentity) -> (ObjectExchange, testing::Links) {
      let (mut obex, links) = obex();
      links
         .lock()
         .open(peer, Channel::L2cap(0x1005), TaskId::ObjectExchange);
      links
         .lock()
         .open(peer, Channel::L2cap(0x1007), TaskId::ObjectExchange);
      obex
         .session_connected(peer, ObexService::MessageAccess, 0x1005, 0x7FFF, 1)
         .unwrap();
      obex
         .session_connected(peer, ObexService::PhonebookAccess, 0x1007, 0x2000, 2)
         .unwrap();
      obex.set_folder(&peer, ObexService::MessageAccess, "telecom/msg/inbox");
      (obex, links)
   }

   #[test]
   fn test_sessions_survive() {
      let peer = testing::peer();
      let (mut primary, _) = connected(peer);
      let bytes = testing::marshal_all(&mut primary, &peer, 8);
      let (mut secondary, _) = obex();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 13));

      let map = secondary.session(&peer, ObexService::MessageAccess).unwrap();
      assert_eq!(map.folder.as_slice(), b"telecom/msg/inbox");
      assert_eq!(map.max_packet, 0x7FFF);
      assert_eq!(
         secondary.session(&peer, ObexService::PhonebookAccess),
         primary.session(&peer, ObexService::PhonebookAccess)
      );
   }

   #[test]
   fn test_long_folder_is_clipped() {
      let peer = testing::peer();
      let (mut obex, _) = connected(peer);
      obex.set_folder(&peer, ObexService::MessageAccess, &"x".repeat(40));
      assert_eq!(obex.session(&peer, ObexService::MessageAccess).unwrap().folder.len(), 32);
   }

   #[test]
   fn test_veto_during_operation() {
      let peer = testing::peer();
      let (mut obex, _) = connected(peer);
      obex.begin(&peer, ObexService::PhonebookAccess, Operation::Get);
      assert!(obex.veto(&peer));
      obex.finish(&peer, ObexService::PhonebookAccess);
      assert!(!obex.veto(&peer));
   }

   #[test]
   fn test_commit_drops_session_without_stream() {
      let peer = testing::peer();
      let (mut primary, primary_links) = connected(peer);
      let bytes = testing::marshal_all(&mut primary, &peer, 64);
      primary_links
         .lock()
         .close(&peer, Channel::L2cap(0x1007));

      let (mut secondary, secondary_links) = obex();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 64));
      secondary_links
         .lock()
         .adopt(&mut primary_links.lock(), &peer);
      secondary.commit(&peer, true);
      secondary.complete(true);

      assert!(secondary.session(&peer, ObexService::MessageAccess).is_some());
      assert!(secondary.session(&peer, ObexService::PhonebookAccess).is_none());
      let links = secondary_links.lock();
      let stream = links.stream(&peer, Channel::L2cap(0x1005)).unwrap();
      assert_eq!(links.binding(stream).unwrap().owner, Some(TaskId::ObjectExchange));
   }
}
