//! Serial port emulation over multiplexed channels.
//!
//! Ports hang off locally registered servers. A port can only be moved to an
//! earbud that registered the same server channel.

use log::{debug, error, info};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
   codec::{Codec, Convert, Snapshot, Step, Transfer},
   error::{HandoverError, Result},
   handover::{
      ProfileContext, ProfileHandover, ProfileId, rebind::rebind_to_task, transfer::Transfers,
   },
   link::Channel,
   peer::PeerIdentity,
   profiles::ChannelState,
   registry::Registry,
};

pub const MAX_SERVERS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SerialPort {
   pub state: ChannelState,
   pub dlci: u8,
   pub max_frame: u16,
   pub modem_status: u8,
   pub credits: u8,
   /// Bytes queued but not yet sent. Never transferred.
   #[serde(skip)]
   pub tx_pending: usize,
}

impl Convert for SerialPort {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.state)?;
      codec.convert(&mut self.dlci)?;
      codec.convert(&mut self.max_frame)?;
      codec.convert(&mut self.modem_status)?;
      codec.convert(&mut self.credits)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortSnapshot {
   pub server_channel: u8,
   pub port: SerialPort,
}

impl Convert for PortSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.server_channel)?;
      codec.convert(&mut self.port)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerialSnapshot {
   pub ports: heapless::Vec<PortSnapshot, MAX_SERVERS>,
}

impl Convert for SerialSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.ports)
   }
}

impl Snapshot for SerialSnapshot {
   const SCHEMA: u8 = 1;
}

pub struct SerialPorts {
   ctx: ProfileContext,
   servers: heapless::Vec<u8, MAX_SERVERS>,
   ports: Registry<SerialPort, u8>,
   transfers: Transfers<SerialSnapshot>,
}

impl SerialPorts {
   pub fn new(ctx: ProfileContext) -> Self {
      Self {
         ctx,
         servers: heapless::Vec::new(),
         ports: Registry::new(),
         transfers: Transfers::new(),
      }
   }

   pub fn register_server(&mut self, server_channel: u8) -> Result<()> {
      if !self.servers.contains(&server_channel) {
         self
            .servers
            .push(server_channel)
            .map_err(|_| HandoverError::RegistryFull)?;
      }
      Ok(())
   }

   pub fn port_opened(
      &mut self,
      peer: PeerIdentity,
      server_channel: u8,
      dlci: u8,
      max_frame: u16,
   ) -> Result<()> {
      if !self.servers.contains(&server_channel) {
         return Err(HandoverError::MissingParent {
            peer,
            profile: ProfileId::SerialPort,
            parent: "server channel",
         });
      }
      self.ports.insert(peer, server_channel, SerialPort {
         state: ChannelState::Connected,
         dlci,
         max_frame,
         credits: 7,
         ..Default::default()
      })?;
      info!("Serial port {server_channel} open for {peer}");
      Ok(())
   }

   pub fn queue(&mut self, peer: &PeerIdentity, server_channel: u8, bytes: usize) {
      if let Some(port) = self.ports.find_link_mut(peer, server_channel) {
         port.tx_pending += bytes;
      }
   }

   pub fn flushed(&mut self, peer: &PeerIdentity, server_channel: u8) {
      if let Some(port) = self.ports.find_link_mut(peer, server_channel) {
         port.tx_pending = 0;
      }
   }

   pub fn disconnected(&mut self, peer: &PeerIdentity) {
      self.ports.remove_peer(peer);
   }

   pub fn port(&self, peer: &PeerIdentity, server_channel: u8) -> Option<&SerialPort> {
      self.ports.find_link(peer, server_channel)
   }
}

impl ProfileHandover for SerialPorts {
   fn id(&self) -> ProfileId {
      ProfileId::SerialPort
   }

   fn veto(&self, peer: &PeerIdentity) -> bool {
      for (server_channel, port) in self.ports.links(peer) {
         if port.state != ChannelState::Connected {
            debug!("serial: port {server_channel} of {peer} is {}", port.state);
            return true;
         }
         if port.tx_pending > 0 {
            debug!("serial: {} bytes unsent on port {server_channel} of {peer}", port.tx_pending);
            return true;
         }
      }
      self.ctx.has_pending(peer)
   }

   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer {
      let ports = &self.ports;
      self
         .transfers
         .marshal(ProfileId::SerialPort, peer, window, |p| {
            let mut snapshot = SerialSnapshot::default();
            for (server_channel, port) in ports.links(p) {
               let _ = snapshot.ports.push(PortSnapshot {
                  server_channel,
                  port: SerialPort {
                     tx_pending: 0,
                     ..port.clone()
                  },
               });
            }
            (!snapshot.ports.is_empty()).then_some(snapshot)
         })
   }

   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer {
      let ports = &mut self.ports;
      let servers = &self.servers;
      self
         .transfers
         .unmarshal(ProfileId::SerialPort, peer, window, |p, snapshot| {
            if !snapshot
               .ports
               .iter()
               .all(|s| servers.contains(&s.server_channel))
            {
               return Err(HandoverError::MissingParent {
                  peer: *p,
                  profile: ProfileId::SerialPort,
                  parent: "server channel",
               });
            }
            for entry in &snapshot.ports {
               *ports.allocate_if_absent(*p, entry.server_channel)? = entry.port.clone();
            }
            ports.retain_links(p, |server_channel| {
               snapshot
                  .ports
                  .iter()
                  .any(|s| s.server_channel == *server_channel)
            });
            Ok(())
         })
   }

   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) {
      if !becoming_primary {
         let released = self.ports.remove_peer(peer);
         debug!("serial: released {released} port(s) of {peer}");
         return;
      }
      let ports: Vec<_> = self
         .ports
         .links(peer)
         .map(|(server_channel, port)| (server_channel, port.dlci))
         .collect();
      for (server_channel, dlci) in ports {
         if let Err(e) = rebind_to_task(&self.ctx, peer, Channel::Rfcomm(dlci)) {
            error!("serial: port {server_channel} of {peer} lost at commit: {e}");
            self.ports.remove(peer, server_channel);
         }
      }
   }

   fn complete(&mut self, _becoming_primary: bool) {
      self.ports.settle();
      self.transfers.clear();
   }

   fn abort(&mut self) {
      self.ports.rollback();
      self.transfers.clear();
   }

   fn take_rejection(&mut self) -> Option<HandoverError> {
      self.transfers.take_rejection()
   }

   fn describe(&self) -> Value {
      json!({
         "servers": self.servers.as_slice(),
         "ports": self.ports.iter().map(|e| json!({
            "peer": e.peer.to_string(),
            "server_channel": e.link,
            "dlci": e.conn.dlci,
            "credits": e.conn.credits,
         })).collect::<Vec<_>>(),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{handover::testing, link::LinkLayer, runtime::TaskId};

   const SERVER: u8 = 3;

   fn serial() -> (SerialPorts, testing::Links) {
      let (ctx, links) = testing::context(TaskId::SerialPort);
      let mut serial = SerialPorts::new(ctx);
      serial.register_server(SERVER).unwrap();
      (serial, links)
   }

   fn open(peer: PeerIdentity) -> (SerialPorts, testing::Links) {
      let (mut serial, links) = serial();
      links
         .lock()
         .open(peer, Channel::Rfcomm(SERVER * 2), TaskId::SerialPort);
      serial.port_opened(peer, SERVER, SERVER * 2, 127).unwrap();
      (serial, links)
   }

   #[test]
   fn test_port_requires_registered_server() {
      let (mut serial, _) = serial();
      assert!(serial.port_opened(testing::peer(), 9, 18, 127).is_err());
   }

   #[test]
   fn test_unmarshal_into_unregistered_server_fails() {
      let peer = testing::peer();
      let (mut primary, _) = open(peer);
      let bytes = testing::marshal_all(&mut primary, &peer, 64);

      let (ctx, _) = testing::context(TaskId::SerialPort);
      let mut bare = SerialPorts::new(ctx);
      assert!(!testing::unmarshal_all(&mut bare, &peer, &bytes, 64));
      assert!(bare.port(&peer, SERVER).is_none());
      bare.abort();
   }

   #[test]
   fn test_veto_on_unsent_data() {
      let peer = testing::peer();
      let (mut serial, _) = open(peer);
      assert!(!serial.veto(&peer));
      serial.queue(&peer, SERVER, 12);
      assert!(serial.veto(&peer));
      serial.flushed(&peer, SERVER);
      assert!(!serial.veto(&peer));
   }

   #[test]
   fn test_handover_rebinds_port() {
      let peer = testing::peer();
      let (mut primary, primary_links) = open(peer);
      let bytes = testing::marshal_all(&mut primary, &peer, 3);

      let (mut secondary, secondary_links) = serial();
      assert!(testing::unmarshal_all(&mut secondary, &peer, &bytes, 2));
      assert_eq!(secondary.port(&peer, SERVER), primary.port(&peer, SERVER));
      secondary_links
         .lock()
         .adopt(&mut primary_links.lock(), &peer);
      secondary.commit(&peer, true);
      secondary.complete(true);

      let links = secondary_links.lock();
      let stream = links.stream(&peer, Channel::Rfcomm(SERVER * 2)).unwrap();
      assert_eq!(links.binding(stream).unwrap().owner, Some(TaskId::SerialPort));
   }
}
