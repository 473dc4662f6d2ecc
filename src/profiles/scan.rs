//! Broadcast scan server: receive states shared by all clients, plus the
//! per-client notification configuration.
//!
//! Both earbuds mirror the receive states, but the mirror can lag behind the
//! primary. The snapshot therefore carries the primary's receive states with
//! every client. The new primary adopts whichever states differ from its own
//! copy at commit and notifies them to clients that enabled notifications.

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
   peer::{BdAddr, PeerIdentity},
   registry::Registry,
   runtime::{Message, MessageKind, Packet},
};

/// Number of receive state characteristics the server exposes.
pub const RECEIVE_STATES: usize = 2;
pub const BROADCAST_CODE_SIZE: usize = 16;

const CCC_NOTIFY: u16 = 0x0001;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PaSyncState {
   #[default]
   NotSynced = 0,
   SyncInfoRequest = 1,
   Synced = 2,
   FailedToSync = 3,
   NoPast = 4,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BigEncryption {
   #[default]
   NotEncrypted = 0,
   CodeRequired = 1,
   Decrypting = 2,
   BadCode = 3,
}

convert_repr!(PaSyncState, BigEncryption);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Subgroup {
   pub bis_sync: u32,
   pub metadata: heapless::Vec<u8, 32>,
}

impl Convert for Subgroup {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.bis_sync)?;
      codec.convert(&mut self.metadata)
   }
}

/// One broadcast receive state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReceiveState {
   pub source_id: u8,
   pub address_type: u8,
   pub source_address: BdAddr,
   pub adv_sid: u8,
   /// 24-bit broadcast identifier.
   pub broadcast_id: u32,
   pub pa_sync: PaSyncState,
   pub encryption: BigEncryption,
   #[serde(skip)]
   pub broadcast_code: [u8; BROADCAST_CODE_SIZE],
   pub bad_code: [u8; BROADCAST_CODE_SIZE],
   pub subgroups: heapless::Vec<Subgroup, 2>,
}

impl Convert for ReceiveState {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.source_id)?;
      codec.convert(&mut self.address_type)?;
      codec.convert(&mut self.source_address)?;
      codec.convert(&mut self.adv_sid)?;
      codec.convert(&mut self.broadcast_id)?;
      codec.convert(&mut self.pa_sync)?;
      codec.convert(&mut self.encryption)?;
      codec.convert(&mut self.broadcast_code)?;
      codec.convert(&mut self.bad_code)?;
      codec.convert(&mut self.subgroups)
   }
}

impl ReceiveState {
   /// Characteristic value as notified to clients. The broadcast code is
   /// never exposed; the bad code only in the bad-code state.
   pub fn characteristic_value(&self) -> Packet {
      let mut value = Packet::new();
      value.push(self.source_id);
      value.push(self.address_type);
      value.extend(self.source_address.0.iter().rev().copied());
      value.push(self.adv_sid);
      value.extend_from_slice(&self.broadcast_id.to_le_bytes()[..3]);
      value.push(self.pa_sync as u8);
      value.push(self.encryption as u8);
      if self.encryption == BigEncryption::BadCode {
         value.extend_from_slice(&self.bad_code);
      }
      value.push(self.subgroups.len() as u8);
      for subgroup in &self.subgroups {
         value.extend_from_slice(&subgroup.bis_sync.to_le_bytes());
         value.push(subgroup.metadata.len() as u8);
         value.extend_from_slice(&subgroup.metadata);
      }
      value
   }
}

/// A connected client of the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ScanClient {
   pub cid: u16,
   /// Client characteristic configuration per receive state.
   pub ccc: heapless::Vec<u16, RECEIVE_STATES>,
   /// An indication is waiting for its confirmation. Never transferred.
   #[serde(skip)]
   pub indication_pending: bool,
}

impl ScanClient {
   fn notifies(&self, index: usize) -> bool {
      self.ccc.get(index).is_some_and(|c| c & CCC_NOTIFY != 0)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanSnapshot {
   pub cid: u16,
   pub ccc: heapless::Vec<u16, RECEIVE_STATES>,
   pub receive_states: heapless::Vec<ReceiveState, RECEIVE_STATES>,
}

impl Convert for ScanSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.cid)?;
      codec.convert(&mut self.ccc)?;
      codec.convert(&mut self.receive_states)
   }
}

impl Snapshot for ScanSnapshot {
   const SCHEMA: u8 = 1;
}

pub struct ScanServer {
   ctx: ProfileContext,
   clients: Registry<ScanClient>,
   receive_states: heapless::Vec<ReceiveState, RECEIVE_STATES>,
   /// Primary's receive states received during the current attempt.
   staged: Option<heapless::Vec<ReceiveState, RECEIVE_STATES>>,
   /// Receive states adopted during the current attempt. Clients committed
   /// later in the same attempt are notified of them too.
   changed: [bool; RECEIVE_STATES],
   transfers: Transfers<ScanSnapshot>,
}

impl ScanServer {
   pub fn new(ctx: ProfileContext) -> Self {
      Self {
         ctx,
         clients: Registry::new(),
         receive_states: heapless::Vec::new(),
         staged: None,
         changed: [false; RECEIVE_STATES],
         transfers: Transfers::new(),
      }
   }

   pub fn client_connected(&mut self, peer: PeerIdentity, cid: u16) -> Result<()> {
      let mut ccc = heapless::Vec::new();
      let _ = ccc.resize(RECEIVE_STATES, 0);
      self.clients.insert(peer, (), ScanClient {
         cid,
         ccc,
         indication_pending: false,
      })?;
      info!("Scan client {peer} on ATT 0x{cid:04x}");
      Ok(())
   }

   pub fn set_ccc(&mut self, peer: &PeerIdentity, index: usize, value: u16) {
      if let Some(slot) = self
         .clients
         .find_link_mut(peer, ())
         .and_then(|c| c.ccc.get_mut(index))
      {
         *slot = value;
      }
   }

   pub fn set_indication_pending(&mut self, peer: &PeerIdentity, pending: bool) {
      if let Some(client) = self.clients.find_link_mut(peer, ()) {
         client.indication_pending = pending;
      }
   }

   /// Adds or replaces the receive state with the same source id.
   pub fn set_receive_state(&mut self, state: ReceiveState) -> Result<()> {
      match self
         .receive_states
         .iter()
         .position(|s| s.source_id == state.source_id)
      {
         Some(index) => self.receive_states[index] = state,
         None => self
            .receive_states
            .push(state)
            .map_err(|_| HandoverError::RegistryFull)?,
      }
      Ok(())
   }

   pub fn receive_states(&self) -> &[ReceiveState] {
      &self.receive_states
   }

   pub fn client(&self, peer: &PeerIdentity) -> Option<&ScanClient> {
      self.clients.find(peer)
   }

   pub fn disconnected(&mut self, peer: &PeerIdentity) {
      self.clients.remove_peer(peer);
   }

   /// Adopts staged receive states that differ from the local copy.
   fn adopt_staged(&mut self) {
      let Some(staged) = self.staged.take() else {
         return;
      };
      for index in 0..RECEIVE_STATES {
         if staged.get(index) != self.receive_states.get(index) {
            self.changed[index] = true;
         }
      }
      if self.changed.iter().any(|c| *c) {
         debug!("scan: adopting primary's receive states {:?}", self.changed);
      }
      self.receive_states = staged;
   }

   fn notify(&self, peer: &PeerIdentity, client: &ScanClient) {
      for (index, state) in self.receive_states.iter().enumerate() {
         if self.changed[index] && client.notifies(index) {
            self.ctx.scheduler.post(
               self.ctx.task,
               Message::for_peer(*peer, MessageKind::Data(state.characteristic_value())),
            );
         }
      }
   }
}

impl ProfileHandover for ScanServer {
   fn id(&self) -> ProfileId {
      ProfileId::BroadcastScan
   }

   fn veto(&self, peer: &PeerIdentity) -> bool {
      if self.clients.find(peer).is_some_and(|c| c.indication_pending) {
         debug!("scan: indication outstanding for {peer}");
         return true;
      }
      self.ctx.has_pending(peer)
   }

   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer {
      let clients = &self.clients;
      let states = &self.receive_states;
      self
         .transfers
         .marshal(ProfileId::BroadcastScan, peer, window, |p| {
            clients.find(p).map(|c| ScanSnapshot {
               cid: c.cid,
               ccc: c.ccc.clone(),
               receive_states: states.clone(),
            })
         })
   }

   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer {
      let clients = &mut self.clients;
      let staged = &mut self.staged;
      self
         .transfers
         .unmarshal(ProfileId::BroadcastScan, peer, window, |p, snapshot| {
            *clients.allocate_if_absent(*p, ())? = ScanClient {
               cid: snapshot.cid,
               ccc: snapshot.ccc,
               indication_pending: false,
            };
            *staged = Some(snapshot.receive_states);
            Ok(())
         })
   }

   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) {
      if !becoming_primary {
         // receive states are shared by every client and stay mirrored
         self.clients.remove_peer(peer);
         return;
      }
      let Some(cid) = self.clients.find(peer).map(|c| c.cid) else {
         return;
      };
      if let Err(e) = rebind_to_task(&self.ctx, peer, Channel::Att(cid)) {
         error!("scan: client {peer} lost at commit: {e}");
         self.clients.remove_peer(peer);
         return;
      }
      self.adopt_staged();
      if let Some(client) = self.clients.find(peer) {
         self.notify(peer, client);
      }
   }

   fn complete(&mut self, _becoming_primary: bool) {
      self.clients.settle();
      self.staged = None;
      self.changed = [false; RECEIVE_STATES];
      self.transfers.clear();
   }

   fn abort(&mut self) {
      self.clients.rollback();
      self.staged = None;
      self.changed = [false; RECEIVE_STATES];
      self.transfers.clear();
   }

   fn take_rejection(&mut self) -> Option<HandoverError> {
      self.transfers.take_rejection()
   }

   fn describe(&self) -> Value {
      json!({
         "clients": self.clients.iter().map(|e| json!({
            "peer": e.peer.to_string(),
            "cid": e.conn.cid,
            "ccc": e.conn.ccc.as_slice(),
         })).collect::<Vec<_>>(),
         "receive_states": self.receive_states.iter().map(|s| json!({
            "source_id": s.source_id,
            "source": s.source_address.to_string(),
            "broadcast_id": format!("0x{:06x}", s.broadcast_id),
            "pa_sync": s.pa_sync.to_string(),
            "encryption": s.encryption.to_string(),
         })).collect::<Vec<_>>(),
      })
   }
}
