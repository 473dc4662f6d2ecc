//! Audio capability server for LE audio clients.
//!
//! Each earbud publishes its own capabilities and audio contexts; those are
//! local and never transferred. What moves is the table of connected
//! clients, keyed by ATT connection id: which characteristics each client
//! subscribed to, the available contexts it was last told about, and the
//! stream endpoints it has configured.

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
   registry::Registry,
   runtime::{Message, MessageKind, Packet},
};

/// Clients one peer can hold at the same time.
pub const MAX_CLIENTS: usize = 2;
/// Stream endpoints the server exposes per client.
pub const MAX_ENDPOINTS: usize = 2;

pub const CCC_NOTIFY: u16 = 0x0001;

/// Characteristics a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Characteristic {
   SinkPac,
   SourcePac,
   SinkLocations,
   SourceLocations,
   AvailableContexts,
   SupportedContexts,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EndpointState {
   #[default]
   Idle = 0,
   CodecConfigured = 1,
   QosConfigured = 2,
   Enabling = 3,
   Streaming = 4,
   Disabling = 5,
   Releasing = 6,
}

impl EndpointState {
   pub const fn is_transient(self) -> bool {
      matches!(self, Self::Enabling | Self::Disabling | Self::Releasing)
   }
}

convert_repr!(EndpointState);

/// Sink and source context bitmasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AudioContexts {
   pub sink: u16,
   pub source: u16,
}

impl AudioContexts {
   pub const fn new(sink: u16, source: u16) -> Self {
      Self { sink, source }
   }

   /// Characteristic value as notified to clients.
   pub fn value(&self) -> Packet {
      let mut value = Packet::new();
      value.extend_from_slice(&self.sink.to_le_bytes());
      value.extend_from_slice(&self.source.to_le_bytes());
      value
   }
}

impl Convert for AudioContexts {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.sink)?;
      codec.convert(&mut self.source)
   }
}

/// Client characteristic configuration of every characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ClientConfig {
   pub sink_pac: u16,
   pub source_pac: u16,
   pub sink_locations: u16,
   pub source_locations: u16,
   pub available_contexts: u16,
   pub supported_contexts: u16,
}

impl ClientConfig {
   pub const fn get(&self, characteristic: Characteristic) -> u16 {
      match characteristic {
         Characteristic::SinkPac => self.sink_pac,
         Characteristic::SourcePac => self.source_pac,
         Characteristic::SinkLocations => self.sink_locations,
         Characteristic::SourceLocations => self.source_locations,
         Characteristic::AvailableContexts => self.available_contexts,
         Characteristic::SupportedContexts => self.supported_contexts,
      }
   }

   fn slot(&mut self, characteristic: Characteristic) -> &mut u16 {
      match characteristic {
         Characteristic::SinkPac => &mut self.sink_pac,
         Characteristic::SourcePac => &mut self.source_pac,
         Characteristic::SinkLocations => &mut self.sink_locations,
         Characteristic::SourceLocations => &mut self.source_locations,
         Characteristic::AvailableContexts => &mut self.available_contexts,
         Characteristic::SupportedContexts => &mut self.supported_contexts,
      }
   }
}

impl Convert for ClientConfig {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.sink_pac)?;
      codec.convert(&mut self.source_pac)?;
      codec.convert(&mut self.sink_locations)?;
      codec.convert(&mut self.source_locations)?;
      codec.convert(&mut self.available_contexts)?;
      codec.convert(&mut self.supported_contexts)
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CodecId {
   pub format: u8,
   pub company: u16,
   pub vendor: u16,
}

impl CodecId {
   pub const LC3: Self = Self {
      format: 0x06,
      company: 0,
      vendor: 0,
   };
}

impl Convert for CodecId {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.format)?;
      codec.convert(&mut self.company)?;
      codec.convert(&mut self.vendor)
   }
}

/// Isochronous channel parameters agreed for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QosConfig {
   pub cig_id: u8,
   pub cis_id: u8,
   pub framing: u8,
   pub phy: u8,
   pub max_sdu: u16,
   pub retransmissions: u8,
   pub max_latency: u16,
   pub sdu_interval: u32,
   pub presentation_delay: u32,
}

impl Convert for QosConfig {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.cig_id)?;
      codec.convert(&mut self.cis_id)?;
      codec.convert(&mut self.framing)?;
      codec.convert(&mut self.phy)?;
      codec.convert(&mut self.max_sdu)?;
      codec.convert(&mut self.retransmissions)?;
      codec.convert(&mut self.max_latency)?;
      codec.convert(&mut self.sdu_interval)?;
      codec.convert(&mut self.presentation_delay)
   }
}

/// A stream endpoint configured by the client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Endpoint {
   pub id: u8,
   pub state: EndpointState,
   pub ccc: u16,
   pub codec: CodecId,
   pub qos: Option<QosConfig>,
   pub metadata: heapless::Vec<u8, 16>,
}

impl Convert for Endpoint {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.id)?;
      codec.convert(&mut self.state)?;
      codec.convert(&mut self.ccc)?;
      codec.convert(&mut self.codec)?;
      codec.convert(&mut self.qos)?;
      codec.convert(&mut self.metadata)
   }
}

/// Per-client state, one per ATT connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CapabilityClient {
   pub config: ClientConfig,
   /// Available contexts as last notified to (or read by) the client.
   pub notified: AudioContexts,
   pub endpoints: heapless::Vec<Endpoint, MAX_ENDPOINTS>,
}

impl CapabilityClient {
   fn subscribed(&self, characteristic: Characteristic) -> bool {
      self.config.get(characteristic) & CCC_NOTIFY != 0
   }
}

impl Convert for CapabilityClient {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.config)?;
      codec.convert(&mut self.notified)?;
      codec.convert(&mut self.endpoints)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientSnapshot {
   pub cid: u16,
   pub client: CapabilityClient,
}

impl Convert for ClientSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.cid)?;
      codec.convert(&mut self.client)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilitySnapshot {
   pub clients: heapless::Vec<ClientSnapshot, MAX_CLIENTS>,
}

impl Convert for CapabilitySnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.clients)
   }
}

impl Snapshot for CapabilitySnapshot {
   const SCHEMA: u8 = 1;
}

pub struct CapabilityServer {
   ctx: ProfileContext,
   supported: AudioContexts,
   available: AudioContexts,
   clients: Registry<CapabilityClient, u16>,
   transfers: Transfers<CapabilitySnapshot>,
}

impl CapabilityServer {
   pub fn new(ctx: ProfileContext) -> Self {
      Self {
         ctx,
         supported: AudioContexts::default(),
         available: AudioContexts::default(),
         clients: Registry::new(),
         transfers: Transfers::new(),
      }
   }

   /// Sets the contexts this earbud supports and currently accepts.
   pub fn publish(&mut self, supported: AudioContexts, available: AudioContexts) {
      self.supported = supported;
      self.set_available(available);
   }

   /// Changes the available contexts and notifies every subscribed client
   /// that has not seen the new value.
   pub fn set_available(&mut self, available: AudioContexts) {
      self.available = available;
      let stale: Vec<_> = self
         .clients
         .iter()
         .filter(|e| e.conn.notified != available)
         .map(|e| (e.peer, e.link))
         .collect();
      for (peer, cid) in stale {
         self.refresh(&peer, cid);
      }
   }

   pub const fn available(&self) -> AudioContexts {
      self.available
   }

   pub fn client_connected(&mut self, peer: PeerIdentity, cid: u16) -> Result<()> {
      self.clients.insert(peer, cid, CapabilityClient {
         notified: self.available,
         ..Default::default()
      })?;
      info!("Capability client {peer} on ATT 0x{cid:04x}");
      Ok(())
   }

   pub fn set_ccc(
      &mut self,
      peer: &PeerIdentity,
      cid: u16,
      characteristic: Characteristic,
      value: u16,
   ) {
      if let Some(client) = self.clients.find_link_mut(peer, cid) {
         *client.config.slot(characteristic) = value;
      }
   }

   /// Configures the codec of an endpoint, creating it on first use.
   pub fn configure_codec(
      &mut self,
      peer: &PeerIdentity,
      cid: u16,
      id: u8,
      codec: CodecId,
   ) -> Result<()> {
      let client = self
         .clients
         .find_link_mut(peer, cid)
         .ok_or(HandoverError::PeerNotConnected(*peer))?;
      match client.endpoints.iter().position(|e| e.id == id) {
         Some(index) => {
            let endpoint = &mut client.endpoints[index];
            endpoint.codec = codec;
            endpoint.qos = None;
            endpoint.state = EndpointState::CodecConfigured;
         },
         None => client
            .endpoints
            .push(Endpoint {
               id,
               state: EndpointState::CodecConfigured,
               codec,
               ..Default::default()
            })
            .map_err(|_| HandoverError::RegistryFull)?,
      }
      Ok(())
   }

   pub fn configure_qos(&mut self, peer: &PeerIdentity, cid: u16, id: u8, qos: QosConfig) {
      if let Some(endpoint) = self.endpoint_mut(peer, cid, id) {
         endpoint.qos = Some(qos);
         endpoint.state = EndpointState::QosConfigured;
      }
   }

   pub fn set_endpoint_state(&mut self, peer: &PeerIdentity, cid: u16, id: u8, state: EndpointState) {
      if let Some(endpoint) = self.endpoint_mut(peer, cid, id) {
         endpoint.state = state;
      }
   }

   pub fn client(&self, peer: &PeerIdentity, cid: u16) -> Option<&CapabilityClient> {
      self.clients.find_link(peer, cid)
   }

   pub fn disconnected(&mut self, peer: &PeerIdentity) {
      self.clients.remove_peer(peer);
   }

   fn endpoint_mut(&mut self, peer: &PeerIdentity, cid: u16, id: u8) -> Option<&mut Endpoint> {
      self
         .clients
         .find_link_mut(peer, cid)?
         .endpoints
         .iter_mut()
         .find(|e| e.id == id)
   }

   /// Tells the client about the current available contexts if it
   /// subscribed and has an older value.
   fn refresh(&mut self, peer: &PeerIdentity, cid: u16) {
      let available = self.available;
      let Some(client) = self.clients.find_link_mut(peer, cid) else {
         return;
      };
      if client.notified == available || !client.subscribed(Characteristic::AvailableContexts) {
         return;
      }
      client.notified = available;
      debug!("capability: contexts {available:?} → {peer} on 0x{cid:04x}");
      self.ctx.scheduler.post(
         self.ctx.task,
         Message::for_peer(*peer, MessageKind::Data(available.value())),
      );
   }
}

impl ProfileHandover for CapabilityServer {
   fn id(&self) -> ProfileId {
      ProfileId::AudioCapability
   }

   fn veto(&self, peer: &PeerIdentity) -> bool {
      for (cid, client) in self.clients.links(peer) {
         if let Some(endpoint) = client.endpoints.iter().find(|e| e.state.is_transient()) {
            debug!(
               "capability: endpoint {} of {peer} on 0x{cid:04x} is {}",
               endpoint.id, endpoint.state
            );
            return true;
         }
      }
      self.ctx.has_pending(peer)
   }

   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer {
      let clients = &self.clients;
      self
         .transfers
         .marshal(ProfileId::AudioCapability, peer, window, |p| {
            let mut snapshot = CapabilitySnapshot::default();
            for (cid, client) in clients.links(p) {
               let _ = snapshot.clients.push(ClientSnapshot {
                  cid,
                  client: client.clone(),
               });
            }
            (!snapshot.clients.is_empty()).then_some(snapshot)
         })
   }

   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer {
      let clients = &mut self.clients;
      self
         .transfers
         .unmarshal(ProfileId::AudioCapability, peer, window, |p, snapshot| {
            for entry in &snapshot.clients {
               *clients.allocate_if_absent(*p, entry.cid)? = entry.client.clone();
            }
            clients.retain_links(p, |cid| snapshot.clients.iter().any(|c| c.cid == *cid));
            Ok(())
         })
   }

   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) {
      if !becoming_primary {
         let released = self.clients.remove_peer(peer);
         debug!("capability: released {released} client(s) of {peer}");
         return;
      }
      let cids: Vec<_> = self.clients.links(peer).map(|(cid, _)| cid).collect();
      for cid in cids {
         if let Err(e) = rebind_to_task(&self.ctx, peer, Channel::Att(cid)) {
            error!("capability: client {peer} on 0x{cid:04x} lost at commit: {e}");
            self.clients.remove(peer, cid);
            continue;
         }
         // this earbud may accept other contexts than the old primary did
         self.refresh(peer, cid);
      }
   }

   fn complete(&mut self, _becoming_primary: bool) {
      self.clients.settle();
      self.transfers.clear();
   }

   fn abort(&mut self) {
      self.clients.rollback();
      self.transfers.clear();
   }

   fn take_rejection(&mut self) -> Option<HandoverError> {
      self.transfers.take_rejection()
   }

   fn describe(&self) -> Value {
      json!({
         "supported": self.supported,
         "available": self.available,
         "clients": self.clients.iter().map(|e| json!({
            "peer": e.peer.to_string(),
            "cid": e.link,
            "endpoints": e.conn.endpoints.iter().map(|ep| json!({
               "id": ep.id,
               "state": ep.state.to_string(),
            })).collect::<Vec<_>>(),
         })).collect::<Vec<_>>(),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{handover::testing, link::LinkLayer, peer::BdAddr, runtime::TaskId};

   const CID: u16 = 0x0004;
   const MEDIA: u16 = 0x0004;
   const CONVERSATIONAL: u16 = 0x0002;

   fn le_peer() -> PeerIdentity {
      PeerIdentity::le(testing::peer().addr)
   }

   fn qos() -> QosConfig {
      QosConfig {
         cig_id: 1,
         cis_id: 1,
         framing: 0,
         phy: 2,
         max_sdu: 100,
         retransmissions: 5,
         max_latency: 20,
         sdu_interval: 10_000,
         presentation_delay: 40_000,
      }
   }

   fn server(available: u16) -> (CapabilityServer, testing::Links) {
      let (ctx, links) = testing::context(TaskId::CapabilityServer);
      let mut server = CapabilityServer::new(ctx);
      server.publish(
         AudioContexts::new(MEDIA | CONVERSATIONAL, CONVERSATIONAL),
         AudioContexts::new(available, 0),
      );
      (server, links)
   }

   fn streaming(peer: PeerIdentity) -> (CapabilityServer, testing::Links) {
      let (mut server, links) = server(MEDIA);
      links.lock().open(peer, Channel::Att(CID), TaskId::CapabilityServer);
      server.client_connected(peer, CID).unwrap();
      server.set_ccc(&peer, CID, Characteristic::AvailableContexts, CCC_NOTIFY);
      server.configure_codec(&peer, CID, 1, CodecId::LC3).unwrap();
      server.configure_qos(&peer, CID, 1, qos());
      server.set_endpoint_state(&peer, CID, 1, EndpointState::Streaming);
      (server, links)
   }

   #[test]
   fn test_client_table_survives_transfer() {
      let peer = le_peer();
      let (mut from, _) = streaming(peer);
      let bytes = testing::marshal_all(&mut from, &peer, 5);

      let (mut to, _) = server(MEDIA);
      assert!(testing::unmarshal_all(&mut to, &peer, &bytes, 3));
      assert_eq!(to.client(&peer, CID), from.client(&peer, CID));
      let endpoint = &to.client(&peer, CID).unwrap().endpoints[0];
      assert_eq!(endpoint.state, EndpointState::Streaming);
      assert_eq!(endpoint.qos, Some(qos()));
   }

   #[test]
   fn test_veto_on_transient_endpoint() {
      let peer = le_peer();
      let (mut server, _) = streaming(peer);
      assert!(!server.veto(&peer));
      for state in [EndpointState::Enabling, EndpointState::Disabling, EndpointState::Releasing] {
         server.set_endpoint_state(&peer, CID, 1, state);
         assert!(server.veto(&peer), "{state} must veto");
      }
      server.set_endpoint_state(&peer, CID, 1, EndpointState::QosConfigured);
      assert!(!server.veto(&peer));
   }

   #[test]
   fn test_abort_restores_client_table() {
      let peer = le_peer();
      let (mut from, _) = streaming(peer);
      let bytes = testing::marshal_all(&mut from, &peer, 64);

      let (mut to, _) = server(MEDIA);
      to.client_connected(peer, CID + 1).unwrap();
      let before = to.client(&peer, CID + 1).cloned();

      assert!(testing::unmarshal_all(&mut to, &peer, &bytes, 64));
      assert!(to.client(&peer, CID).is_some());
      assert!(to.client(&peer, CID + 1).is_none());

      to.abort();
      assert!(to.client(&peer, CID).is_none());
      assert_eq!(to.client(&peer, CID + 1).cloned(), before);
   }

   #[test]
   fn test_commit_notifies_new_contexts() {
      let peer = le_peer();
      let (mut from, from_links) = streaming(peer);
      let bytes = testing::marshal_all(&mut from, &peer, 16);

      let (mut to, to_links) = server(MEDIA | CONVERSATIONAL);
      assert!(testing::unmarshal_all(&mut to, &peer, &bytes, 16));
      to_links.lock().adopt(&mut from_links.lock(), &peer);
      to.commit(&peer, true);
      from.commit(&peer, false);
      to.complete(true);
      from.complete(false);

      let message = to.ctx.scheduler.pop(TaskId::CapabilityServer).unwrap();
      assert_eq!(message.peer, Some(peer));
      assert_eq!(
         message.kind,
         MessageKind::Data(AudioContexts::new(MEDIA | CONVERSATIONAL, 0).value())
      );
      assert_eq!(to.client(&peer, CID).unwrap().notified, to.available());

      let links = to_links.lock();
      let stream = links.stream(&peer, Channel::Att(CID)).unwrap();
      assert_eq!(links.binding(stream).unwrap().owner, Some(TaskId::CapabilityServer));
      assert!(from.client(&peer, CID).is_none());
   }

   #[test]
   fn test_unsubscribed_client_not_notified() {
      let peer = le_peer();
      let (mut server, _) = streaming(peer);
      let other = PeerIdentity::le(BdAddr::new([0xC0, 1, 2, 3, 4, 5]));
      server.client_connected(other, CID).unwrap();

      server.set_available(AudioContexts::new(CONVERSATIONAL, 0));
      let notified: Vec<_> =
         std::iter::from_fn(|| server.ctx.scheduler.pop(TaskId::CapabilityServer))
            .filter_map(|m| m.peer)
            .collect();
      assert_eq!(notified, vec![peer]);
      assert_eq!(server.client(&other, CID).unwrap().notified, AudioContexts::new(MEDIA, 0));
   }
}
