//! Service discovery: cached remote service records and the open search
//! channel, if any.

use log::{debug, error};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
   codec::{Codec, Convert, Snapshot, Step, Transfer},
   error::{HandoverError, Result},
   handover::{
      ProfileContext, ProfileHandover, ProfileId, rebind::rebind_to_task, transfer::Transfers,
   },
   link::Channel,
   peer::PeerIdentity,
   registry::Registry,
};

pub const MAX_RECORDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ServiceRecord {
   pub handle: u32,
   pub class: Uuid,
   pub version: u16,
}

impl Convert for ServiceRecord {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.handle)?;
      codec.convert(&mut self.class)?;
      codec.convert(&mut self.version)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SdpSession {
   pub cid: Option<u16>,
   pub mtu: u16,
   pub records: heapless::Vec<ServiceRecord, MAX_RECORDS>,
   #[serde(skip)]
   pub searching: bool,
   /// Continuation state of a partial response. Never transferred.
   #[serde(skip)]
   pub continuation: Option<heapless::Vec<u8, 16>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdpSnapshot {
   pub cid: Option<u16>,
   pub mtu: u16,
   pub records: heapless::Vec<ServiceRecord, MAX_RECORDS>,
}

impl Convert for SdpSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.cid)?;
      codec.convert(&mut self.mtu)?;
      codec.convert(&mut self.records)
   }
}

impl Snapshot for SdpSnapshot {
   const SCHEMA: u8 = 1;
}

pub struct ServiceDiscovery {
   ctx: ProfileContext,
   sessions: Registry<SdpSession>,
   transfers: Transfers<SdpSnapshot>,
}

impl ServiceDiscovery {
   pub fn new(ctx: ProfileContext) -> Self {
      Self {
         ctx,
         sessions: Registry::new(),
         transfers: Transfers::new(),
      }
   }

   /// Starts a search on a freshly opened channel.
   pub fn search_started(&mut self, peer: PeerIdentity, cid: u16, mtu: u16) -> Result<()> {
      if !self.sessions.contains(&peer) {
         self.sessions.insert(peer, (), SdpSession::default())?;
      }
      if let Some(session) = self.sessions.find_link_mut(&peer, ()) {
         session.cid = Some(cid);
         session.mtu = mtu;
         session.searching = true;
      }
      Ok(())
   }

   /// Records a response. A continuation keeps the search open.
   pub fn record_found(
      &mut self,
      peer: &PeerIdentity,
      record: ServiceRecord,
      continuation: Option<&[u8]>,
   ) {
      let Some(session) = self.sessions.find_link_mut(peer, ()) else {
         return;
      };
      if !session.records.iter().any(|r| r.handle == record.handle)
         && session.records.push(record).is_err()
      {
         debug!("sdp: record cache full for {peer}, dropping 0x{:08x}", record.handle);
      }
      session.continuation = continuation.and_then(|c| heapless::Vec::from_slice(c).ok());
      session.searching = session.continuation.is_some();
   }

   /// Closes the search channel, keeping the cached records.
   pub fn channel_closed(&mut self, peer: &PeerIdentity) {
      if let Some(session) = self.sessions.find_link_mut(peer, ()) {
         session.cid = None;
         session.searching = false;
         session.continuation = None;
      }
   }

   pub fn disconnected(&mut self, peer: &PeerIdentity) {
      self.sessions.remove_peer(peer);
   }

   pub fn session(&self, peer: &PeerIdentity) -> Option<&SdpSession> {
      self.sessions.find(peer)
   }
}

impl ProfileHandover for ServiceDiscovery {
   fn id(&self) -> ProfileId {
      ProfileId::ServiceDiscovery
   }

   fn veto(&self, peer: &PeerIdentity) -> bool {
      if let Some(session) = self.sessions.find(peer)
         && (session.searching || session.continuation.is_some())
      {
         debug!("sdp: search in progress with {peer}");
         return true;
      }
      self.ctx.has_pending(peer)
   }

   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer {
      let sessions = &self.sessions;
      self
         .transfers
         .marshal(ProfileId::ServiceDiscovery, peer, window, |p| {
            sessions.find(p).map(|s| SdpSnapshot {
               cid: s.cid,
               mtu: s.mtu,
               records: s.records.clone(),
            })
         })
   }

   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer {
      let sessions = &mut self.sessions;
      self
         .transfers
         .unmarshal(ProfileId::ServiceDiscovery, peer, window, |p, snapshot| {
            *sessions.allocate_if_absent(*p, ())? = SdpSession {
               cid: snapshot.cid,
               mtu: snapshot.mtu,
               records: snapshot.records,
               ..Default::default()
            };
            Ok(())
         })
   }

   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) {
      if !becoming_primary {
         if self.sessions.remove_peer(peer) > 0 {
            debug!("sdp: released {peer}");
         }
         return;
      }
      let Some(cid) = self.sessions.find(peer).and_then(|s| s.cid) else {
         return;
      };
      if let Err(e) = rebind_to_task(&self.ctx, peer, Channel::L2cap(cid)) {
         // the records are still good without the channel
         error!("sdp: channel of {peer} lost at commit: {e}");
         if let Some(session) = self.sessions.find_link_mut(peer, ()) {
            session.cid = None;
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
               "cid": e.conn.cid,
               "records": e.conn.records.iter().map(|r| json!({
                  "handle": format!("0x{:08x}", r.handle),
                  "class": r.class.to_string(),
                  "version": r.version,
               })).collect::<Vec<_>>(),
            })
         })
         .collect();
      json!(sessions)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{handover::testing, runtime::TaskId};

   const AUDIO_SINK: Uuid = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);
   const AV_REMOTE: Uuid = Uuid::from_u128(0x0000110e_0000_1000_8000_00805f9b34fb);

   fn discovery() -> ServiceDiscovery {
      let (ctx, _) = testing::context(TaskId::ServiceDiscovery);
      ServiceDiscovery::new(ctx)
   }

   fn populated(peer: PeerIdentity) -> ServiceDiscovery {
      let mut sdp = discovery();
      sdp.search_started(peer, 0x40, 672).unwrap();
      sdp.record_found(&peer, ServiceRecord {
         handle: 0x0001_0001,
         class: AUDIO_SINK,
         version: 0x0104,
      }, Some(&[0x02, 0x00, 0x10]));
      sdp.record_found(&peer, ServiceRecord {
         handle: 0x0001_0002,
         class: AV_REMOTE,
         version: 0x0106,
      }, None);
      sdp.channel_closed(&peer);
      sdp
   }

   #[test]
   fn test_records_survive() {
      let peer = testing::peer();
      let mut primary = populated(peer);
      let bytes = testing::marshal_all(&mut primary, &peer, 9);
      let mut secondary = discovery();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 4));
      assert_eq!(secondary.session(&peer), primary.session(&peer));
      assert_eq!(secondary.session(&peer).unwrap().records[1].class, AV_REMOTE);
   }

   #[test]
   fn test_veto_while_searching() {
      let peer = testing::peer();
      let mut sdp = discovery();
      sdp.search_started(peer, 0x40, 672).unwrap();
      assert!(sdp.veto(&peer));
      sdp.record_found(&peer, ServiceRecord::default(), Some(&[1]));
      assert!(sdp.veto(&peer));
      sdp.record_found(&peer, ServiceRecord::default(), None);
      assert!(!sdp.veto(&peer));
   }

   #[test]
   fn test_commit_without_channel_keeps_records() {
      let peer = testing::peer();
      let mut primary = discovery();
      primary.search_started(peer, 0x40, 672).unwrap();
      primary.record_found(&peer, ServiceRecord::default(), None);
      let bytes = testing::marshal_all(&mut primary, &peer, 64);

      // no stream was adopted for cid 0x40
      let mut secondary = discovery();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 64));
      secondary.commit(&peer, true);
      secondary.complete(true);
      let session = secondary.session(&peer).unwrap();
      assert_eq!(session.cid, None);
      assert_eq!(session.records.len(), 1);
   }

   #[test]
   fn test_abort_removes_allocated_session() {
      let peer = testing::peer();
      let mut primary = populated(peer);
      let bytes = testing::marshal_all(&mut primary, &peer, 64);
      let mut secondary = discovery();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 64));
      secondary.abort();
      assert!(secondary.session(&peer).is_none());
   }
}
