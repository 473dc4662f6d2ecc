//! One earbud of the pair: scheduler, link layer, coordinator and the full
//! profile set.
//!
//! [`Earbud::handover`] runs a complete attempt between two earbuds in the
//! same process, including the radio-level move of every stream.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   error::{HandoverError, Result},
   event::EventSender,
   handover::{ProfileContext, ProfileHandover, coordinator::Coordinator},
   link::{Channel, MemoryLinkLayer, SharedLinkLayer},
   peer::{PeerIdentity, Transport},
   profiles::{
      acl::{AclParams, ConnectionManager, LeParams, LinkRole, PowerMode},
      capability::{
         AudioContexts, CCC_NOTIFY, CapabilityServer, Characteristic, CodecId, EndpointState,
      },
      discovery::{ServiceDiscovery, ServiceRecord},
      obex::ObjectExchange,
      remote::RemoteControl,
      scan::ScanServer,
      serial::SerialPorts,
      stream::StreamControl,
   },
   runtime::{Scheduler, TaskId},
};

/// Server channel both earbuds register for the serial port profile.
pub const SERIAL_SERVER_CHANNEL: u8 = 3;

const SIGNALLING_CID: u16 = 0x0040;
const MEDIA_CID: u16 = 0x0041;
const REMOTE_CID: u16 = 0x0042;
const ATT_CID: u16 = 0x0004;
const DEFAULT_MTU: u16 = 672;
const AUDIO_SINK: Uuid = Uuid::from_u128(0x0000_110b_0000_1000_8000_0080_5f9b_34fb);
/// Media and conversational audio contexts.
const AUDIO_CONTEXTS: AudioContexts = AudioContexts::new(0x0006, 0x0002);

/// Which earbud currently owns the phone connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
   Primary,
   Secondary,
}

pub struct Earbud {
   name: SmolStr,
   role: Role,
   scheduler: Scheduler,
   links: Arc<Mutex<MemoryLinkLayer>>,
   coordinator: Coordinator,
}

impl Earbud {
   pub fn new(
      name: impl Into<SmolStr>,
      role: Role,
      window_size: usize,
      events: Option<EventSender>,
   ) -> Result<Self> {
      let scheduler = Scheduler::new();
      let links = MemoryLinkLayer::shared();
      let mut coordinator = Coordinator::new(window_size);
      if let Some(events) = events {
         coordinator = coordinator.with_events(events);
      }

      let shared: SharedLinkLayer = links.clone();
      let ctx = |task| ProfileContext::new(task, scheduler.clone(), shared.clone());
      let mut serial = SerialPorts::new(ctx(TaskId::SerialPort));
      serial.register_server(SERIAL_SERVER_CHANNEL)?;

      coordinator.register(Box::new(ConnectionManager::new(ctx(TaskId::ConnectionManager))));
      coordinator.register(Box::new(StreamControl::new(ctx(TaskId::StreamControl))));
      coordinator.register(Box::new(RemoteControl::new(ctx(TaskId::RemoteControl))));
      coordinator.register(Box::new(ServiceDiscovery::new(ctx(TaskId::ServiceDiscovery))));
      coordinator.register(Box::new(ScanServer::new(ctx(TaskId::ScanServer))));
      let mut capability = CapabilityServer::new(ctx(TaskId::CapabilityServer));
      capability.publish(AUDIO_CONTEXTS, AUDIO_CONTEXTS);
      coordinator.register(Box::new(capability));
      coordinator.register(Box::new(ObjectExchange::new(ctx(TaskId::ObjectExchange))));
      coordinator.register(Box::new(serial));

      Ok(Self {
         name: name.into(),
         role,
         scheduler,
         links,
         coordinator,
      })
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub const fn role(&self) -> Role {
      self.role
   }

   pub fn is_primary(&self) -> bool {
      self.role == Role::Primary
   }

   pub fn scheduler(&self) -> &Scheduler {
      &self.scheduler
   }

   pub fn links(&self) -> &Arc<Mutex<MemoryLinkLayer>> {
      &self.links
   }

   pub fn coordinator(&self) -> &Coordinator {
      &self.coordinator
   }

   pub fn profile<P: ProfileHandover>(&self) -> Option<&P> {
      self.coordinator.profile::<P>()
   }

   pub fn profile_mut<P: ProfileHandover>(&mut self) -> Option<&mut P> {
      self.coordinator.profile_mut::<P>()
   }

   fn require<P: ProfileHandover>(&mut self) -> Result<&mut P> {
      self
         .coordinator
         .profile_mut::<P>()
         .ok_or_else(|| {
            HandoverError::InvalidConfig(format!(
               "{} has no {} module",
               self.name,
               std::any::type_name::<P>()
            ))
         })
   }

   /// Peers with a baseband link to this earbud.
   pub fn peers(&self) -> Vec<PeerIdentity> {
      self
         .profile::<ConnectionManager>()
         .map(|acl| acl.peers().collect())
         .unwrap_or_default()
   }

   /// Brings up a phone the way the primary sees it. BR/EDR phones get
   /// audio streaming, remote control and a service record cache; LE phones
   /// become broadcast scan and audio capability clients.
   pub fn connect_phone(&mut self, peer: PeerIdentity, streaming: bool) -> Result<()> {
      let le = (peer.transport == Transport::Le).then_some(LeParams {
         interval: 24,
         latency: 0,
         timeout: 400,
         phy: 2,
      });
      self.require::<ConnectionManager>()?.connected(peer, AclParams {
         role: LinkRole::Peripheral,
         mode: PowerMode::Sniff,
         link_policy: 0x0005,
         supervision_timeout: 0x1F40,
         sniff_interval: 0x0320,
         class_of_device: 0x24_0404,
         encrypted: true,
         le,
         ..Default::default()
      })?;

      if peer.transport == Transport::Le {
         self
            .links
            .lock()
            .open(peer, Channel::Att(ATT_CID), TaskId::ScanServer);
         self.require::<ScanServer>()?.client_connected(peer, ATT_CID)?;
         let capability = self.require::<CapabilityServer>()?;
         capability.client_connected(peer, ATT_CID)?;
         capability.set_ccc(&peer, ATT_CID, Characteristic::AvailableContexts, CCC_NOTIFY);
         capability.configure_codec(&peer, ATT_CID, 1, CodecId::LC3)?;
         if streaming {
            capability.set_endpoint_state(&peer, ATT_CID, 1, EndpointState::Streaming);
         }
         info!("{}: {peer} connected over LE", self.name);
         return Ok(());
      }

      {
         let mut links = self.links.lock();
         links.open(peer, Channel::L2cap(SIGNALLING_CID), TaskId::StreamControl);
         links.open(peer, Channel::L2cap(MEDIA_CID), TaskId::StreamControl);
         links.open(peer, Channel::L2cap(REMOTE_CID), TaskId::RemoteControl);
      }
      let stream = self.require::<StreamControl>()?;
      stream.signalling_connected(peer, SIGNALLING_CID, DEFAULT_MTU, true)?;
      stream.media_opened(peer, MEDIA_CID, DEFAULT_MTU)?;
      if streaming {
         stream.start_streaming(&peer, 128_000, DEFAULT_MTU);
      }
      self
         .require::<RemoteControl>()?
         .control_connected(peer, REMOTE_CID, DEFAULT_MTU)?;

      let sdp = self.require::<ServiceDiscovery>()?;
      sdp.search_started(peer, 0x0043, DEFAULT_MTU)?;
      sdp.record_found(
         &peer,
         ServiceRecord {
            handle: 0x0001_0001,
            class: AUDIO_SINK,
            version: 0x0104,
         },
         None,
      );
      sdp.channel_closed(&peer);

      info!("{}: {peer} connected{}", self.name, if streaming { ", streaming" } else { "" });
      Ok(())
   }

   /// Drops every profile connection of the peer.
   pub fn disconnect(&mut self, peer: &PeerIdentity) {
      if let Some(p) = self.profile_mut::<ConnectionManager>() {
         p.disconnected(peer);
      }
      if let Some(p) = self.profile_mut::<StreamControl>() {
         p.disconnected(peer);
      }
      if let Some(p) = self.profile_mut::<RemoteControl>() {
         p.disconnected(peer);
      }
      if let Some(p) = self.profile_mut::<ServiceDiscovery>() {
         p.disconnected(peer);
      }
      if let Some(p) = self.profile_mut::<ScanServer>() {
         p.disconnected(peer);
      }
      if let Some(p) = self.profile_mut::<CapabilityServer>() {
         p.disconnected(peer);
      }
      if let Some(p) = self.profile_mut::<ObjectExchange>() {
         p.disconnected(peer);
      }
      if let Some(p) = self.profile_mut::<SerialPorts>() {
         p.disconnected(peer);
      }
      let mut links = self.links.lock();
      for (_, binding) in links.streams_for(peer) {
         links.close(peer, binding.channel);
      }
   }

   /// Lets every task process its queue. Returns the number of messages.
   pub fn pump(&self) -> usize {
      self.scheduler.dispatch_all(|_, _| {})
   }

   /// Moves the given peers from `from` to `to` and swaps their roles.
   ///
   /// A veto or transfer failure aborts both earbuds and leaves the pair as
   /// it was. Once the first commit has run the attempt always completes.
   pub fn handover(from: &mut Earbud, to: &mut Earbud, peers: &[PeerIdentity]) -> Result<()> {
      info!("Handover {} → {} for {} peer(s)", from.name, to.name, peers.len());
      if let Err(e) = Self::transfer(from, to, peers) {
         for earbud in [&mut *from, &mut *to] {
            if let Err(abort) = earbud.coordinator.abort() {
               warn!("{}: abort refused: {abort}", earbud.name);
            }
         }
         return Err(e);
      }

      {
         let mut target = to.links.lock();
         let mut source = from.links.lock();
         for peer in peers {
            let moved = target.adopt(&mut source, peer);
            info!("{peer}: {moved} stream(s) moved to {}", to.name);
         }
      }

      let mut outcome = Ok(());
      for peer in peers {
         for (earbud, primary) in [(&mut *to, true), (&mut *from, false)] {
            if let Err(e) = earbud.coordinator.commit(peer, primary)
               && outcome.is_ok()
            {
               outcome = Err(e);
            }
         }
      }
      to.coordinator.complete(true);
      from.coordinator.complete(false);
      to.role = Role::Primary;
      from.role = Role::Secondary;
      outcome
   }

   fn transfer(from: &mut Earbud, to: &mut Earbud, peers: &[PeerIdentity]) -> Result<()> {
      // only the side holding the live connections can object
      from.coordinator.veto(peers)?;
      for peer in peers {
         let blob = from.coordinator.marshal(peer)?;
         to.coordinator.unmarshal(peer, &blob)?;
      }
      Ok(())
   }

   pub fn describe(&self) -> Value {
      json!({
         "name": self.name.as_str(),
         "role": self.role,
         "phase": self.coordinator.phase().to_string(),
         "profiles": self.coordinator.describe(),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      handover::{coordinator::Phase, testing},
      link::{Destination, LinkLayer},
      peer::BdAddr,
      profiles::{
         acl::AclState,
         remote::RemoteLink,
         stream::{StreamLink, Streaming},
      },
      runtime::{Message, MessageKind},
   };

   fn pair() -> (Earbud, Earbud) {
      (
         Earbud::new("left", Role::Primary, 16, None).unwrap(),
         Earbud::new("right", Role::Secondary, 16, None).unwrap(),
      )
   }

   #[test]
   fn test_streaming_phone_moves() {
      let peer = testing::peer();
      let (mut left, mut right) = pair();
      left.connect_phone(peer, true).unwrap();

      Earbud::handover(&mut left, &mut right, &[peer]).unwrap();
      assert!(right.is_primary());
      assert!(!left.is_primary());
      assert!(left.profile::<ConnectionManager>().unwrap().link(&peer).is_none());

      let stream = right.profile::<StreamControl>().unwrap();
      assert_eq!(
         stream.channel(&peer, StreamLink::Media).unwrap().streaming,
         Some(Streaming {
            bit_rate: 128_000,
            mtu: 672
         })
      );
      assert_eq!(
         right.profile::<ConnectionManager>().unwrap().link(&peer).unwrap().state,
         AclState::Connected
      );

      let links = right.links().lock();
      let media = links.stream(&peer, Channel::L2cap(MEDIA_CID)).unwrap();
      assert_eq!(links.binding(media).unwrap().destination, Some(Destination::AudioPath));
      assert!(left.links().lock().streams_for(&peer).is_empty());
      assert_eq!(right.coordinator().phase(), Phase::Idle);
   }

   #[test]
   fn test_round_trip_handover() {
      let peer = testing::peer();
      let (mut left, mut right) = pair();
      left.connect_phone(peer, true).unwrap();
      let before = left.profile::<RemoteControl>().unwrap().channel(&peer, RemoteLink::Control).cloned();

      Earbud::handover(&mut left, &mut right, &[peer]).unwrap();
      Earbud::handover(&mut right, &mut left, &[peer]).unwrap();
      assert!(left.is_primary());
      assert_eq!(
         left.profile::<RemoteControl>().unwrap().channel(&peer, RemoteLink::Control).cloned(),
         before
      );
      assert!(left.profile::<StreamControl>().unwrap().is_streaming(&peer));
   }

   #[test]
   fn test_multiple_peers() {
      let phone = testing::peer();
      let watch = PeerIdentity::le(testing::other_peer().addr);
      let (mut left, mut right) = pair();
      left.connect_phone(phone, false).unwrap();
      left.connect_phone(watch, false).unwrap();

      Earbud::handover(&mut left, &mut right, &[phone, watch]).unwrap();
      let mut peers = right.peers();
      peers.sort_by_key(|p| p.addr);
      assert_eq!(peers, vec![phone, watch]);
      assert!(right.profile::<ScanServer>().unwrap().client(&watch).is_some());
   }

   #[test]
   fn test_veto_leaves_pair_untouched() {
      let peer = testing::peer();
      let (mut left, mut right) = pair();
      left.connect_phone(peer, true).unwrap();
      left
         .scheduler()
         .post(TaskId::StreamControl, Message::for_peer(peer, MessageKind::Timer));

      assert!(matches!(
         Earbud::handover(&mut left, &mut right, &[peer]),
         Err(HandoverError::Vetoed { .. })
      ));
      assert!(left.is_primary());
      assert!(right.peers().is_empty());
      assert_eq!(left.links().lock().streams_for(&peer).len(), 3);

      assert_eq!(left.pump(), 1);
      Earbud::handover(&mut left, &mut right, &[peer]).unwrap();
      assert_eq!(right.peers(), vec![peer]);
   }

   #[test]
   fn test_old_primary_releases_handed_over_peers() {
      let (mut left, mut right) = pair();
      for round in 0..24u8 {
         let addr = BdAddr::new([0xAA, 0, 0, 0, 0, round]);
         let phone = if round % 3 == 0 {
            PeerIdentity::le(addr)
         } else {
            PeerIdentity::bredr(addr)
         };
         let (from, to) = if left.is_primary() {
            (&mut left, &mut right)
         } else {
            (&mut right, &mut left)
         };
         from.connect_phone(phone, round % 2 == 0).unwrap();
         Earbud::handover(from, to, &[phone]).unwrap();

         assert!(from.peers().is_empty());
         assert!(from.profile::<StreamControl>().unwrap().channel(&phone, StreamLink::Signalling).is_none());
         assert!(from.profile::<RemoteControl>().unwrap().channel(&phone, RemoteLink::Control).is_none());
         assert!(from.profile::<ServiceDiscovery>().unwrap().session(&phone).is_none());
         assert!(from.profile::<ScanServer>().unwrap().client(&phone).is_none());
         assert!(from.profile::<CapabilityServer>().unwrap().client(&phone, ATT_CID).is_none());

         to.disconnect(&phone);
         assert!(to.peers().is_empty());
      }
   }

   #[test]
   fn test_disconnect_closes_streams() {
      let peer = testing::peer();
      let (mut left, _) = pair();
      left.connect_phone(peer, false).unwrap();
      left.disconnect(&peer);
      assert!(left.peers().is_empty());
      assert!(left.links().lock().is_empty());
      assert!(left.describe()["profiles"]["acl"].as_array().unwrap().is_empty());
   }
}
