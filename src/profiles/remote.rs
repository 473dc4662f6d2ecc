//! Remote control: a control channel and an optional browsing channel.
//!
//! The browsing channel only exists alongside the control channel. Besides
//! the channel parameters, the control channel carries the session state a
//! phone expects the earbud to remember: registered notifications, absolute
//! volume, play status and the media database UID counter.

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
pub enum RemoteLink {
   #[default]
   Control = 0,
   Browsing = 1,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PlayStatus {
   #[default]
   Stopped = 0,
   Playing = 1,
   Paused = 2,
   FwdSeek = 3,
   RevSeek = 4,
   Error = 0xFF,
}

convert_repr!(RemoteLink, PlayStatus);

/// Session state of one remote control channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RemoteChannel {
   pub state: ChannelState,
   pub cid: u16,
   pub mtu: u16,
   pub version: u16,
   pub features: u16,
   /// Bit per registered notification event.
   pub notifications: u32,
   pub volume: u8,
   pub play_status: PlayStatus,
   pub uid_counter: u16,
   /// Outstanding command transaction label. Never transferred.
   #[serde(skip)]
   pub pending_label: Option<u8>,
   /// A fragmented response is being reassembled. Never transferred.
   #[serde(skip)]
   pub fragmenting: bool,
}

impl Convert for RemoteChannel {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.state)?;
      codec.convert(&mut self.cid)?;
      codec.convert(&mut self.mtu)?;
      codec.convert(&mut self.version)?;
      codec.convert(&mut self.features)?;
      codec.convert(&mut self.notifications)?;
      codec.convert(&mut self.volume)?;
      codec.convert(&mut self.play_status)?;
      codec.convert(&mut self.uid_counter)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteLinkSnapshot {
   pub link: RemoteLink,
   pub channel: RemoteChannel,
}

impl Convert for RemoteLinkSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.link)?;
      codec.convert(&mut self.channel)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteSnapshot {
   pub links: heapless::Vec<RemoteLinkSnapshot, 2>,
}

impl Convert for RemoteSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.links)
   }
}

impl Snapshot for RemoteSnapshot {
   const SCHEMA: u8 = 1;
}

/// Remote control handover module.
pub struct RemoteControl {
   ctx: ProfileContext,
   channels: Registry<RemoteChannel, RemoteLink>,
   transfers: Transfers<RemoteSnapshot>,
}

impl RemoteControl {
   pub fn new(ctx: ProfileContext) -> Self {
      Self {
         ctx,
         channels: Registry::new(),
         transfers: Transfers::new(),
      }
   }

   pub fn control_connected(&mut self, peer: PeerIdentity, cid: u16, mtu: u16) -> Result<()> {
      self.channels.insert(peer, RemoteLink::Control, RemoteChannel {
         state: ChannelState::Connected,
         cid,
         mtu,
         version: 0x0106,
         volume: 0x40,
         ..Default::default()
      })?;
      info!("Remote control up for {peer}");
      Ok(())
   }

   pub fn browsing_connected(&mut self, peer: PeerIdentity, cid: u16, mtu: u16) -> Result<()> {
      if self.channels.find_link(&peer, RemoteLink::Control).is_none() {
         return Err(HandoverError::PeerNotConnected(peer));
      }
      self.channels.insert(peer, RemoteLink::Browsing, RemoteChannel {
         state: ChannelState::Connected,
         cid,
         mtu,
         ..Default::default()
      })?;
      Ok(())
   }

   pub fn register_notification(&mut self, peer: &PeerIdentity, event: u8) {
      if let Some(control) = self.channels.find_link_mut(peer, RemoteLink::Control) {
         control.notifications |= 1 << (event & 0x1F);
      }
   }

   pub fn set_volume(&mut self, peer: &PeerIdentity, volume: u8) {
      if let Some(control) = self.channels.find_link_mut(peer, RemoteLink::Control) {
         control.volume = volume & 0x7F;
      }
   }

   pub fn set_play_status(&mut self, peer: &PeerIdentity, status: PlayStatus) {
      if let Some(control) = self.channels.find_link_mut(peer, RemoteLink::Control) {
         control.play_status = status;
      }
   }

   pub fn set_pending_label(&mut self, peer: &PeerIdentity, link: RemoteLink, label: Option<u8>) {
      if let Some(channel) = self.channels.find_link_mut(peer, link) {
         channel.pending_label = label;
      }
   }

   pub fn set_fragmenting(&mut self, peer: &PeerIdentity, fragmenting: bool) {
      if let Some(control) = self.channels.find_link_mut(peer, RemoteLink::Control) {
         control.fragmenting = fragmenting;
      }
   }

   pub fn disconnected(&mut self, peer: &PeerIdentity) {
      self.channels.remove_peer(peer);
   }

   pub fn channel(&self, peer: &PeerIdentity, link: RemoteLink) -> Option<&RemoteChannel> {
      self.channels.find_link(peer, link)
   }
}

fn capture(
   channels: &Registry<RemoteChannel, RemoteLink>,
   peer: &PeerIdentity,
) -> Option<RemoteSnapshot> {
   let mut snapshot = RemoteSnapshot::default();
   for (link, channel) in channels.links(peer) {
      let _ = snapshot.links.push(RemoteLinkSnapshot {
         link,
         channel: RemoteChannel {
            pending_label: None,
            fragmenting: false,
            ..channel.clone()
         },
      });
   }
   (!snapshot.links.is_empty()).then_some(snapshot)
}

fn apply(
   channels: &mut Registry<RemoteChannel, RemoteLink>,
   peer: &PeerIdentity,
   snapshot: RemoteSnapshot,
) -> Result<()> {
   if !snapshot.links.iter().any(|l| l.link == RemoteLink::Control) {
      return Err(HandoverError::MissingParent {
         peer: *peer,
         profile: ProfileId::RemoteControl,
         parent: "control channel",
      });
   }
   for entry in &snapshot.links {
      *channels.allocate_if_absent(*peer, entry.link)? = entry.channel.clone();
   }
   channels.retain_links(peer, |link| snapshot.links.iter().any(|l| l.link == *link));
   Ok(())
}

impl ProfileHandover for RemoteControl {
   fn id(&self) -> ProfileId {
      ProfileId::RemoteControl
   }

   fn veto(&self, peer: &PeerIdentity) -> bool {
      for (link, channel) in self.channels.links(peer) {
         if channel.state.is_transient() {
            debug!("remote: {link} channel of {peer} is {}", channel.state);
            return true;
         }
         if channel.pending_label.is_some() || channel.fragmenting {
            debug!("remote: {link} transaction in flight for {peer}");
            return true;
         }
      }
      self.ctx.has_pending(peer)
   }

   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer {
      let channels = &self.channels;
      self
         .transfers
         .marshal(ProfileId::RemoteControl, peer, window, |p| capture(channels, p))
   }

   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer {
      let channels = &mut self.channels;
      self
         .transfers
         .unmarshal(ProfileId::RemoteControl, peer, window, |p, snapshot| {
            apply(channels, p, snapshot)
         })
   }

   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) {
      if !becoming_primary {
         // the channels now live on the other earbud
         let released = self.channels.remove_peer(peer);
         debug!("remote: released {released} channel(s) of {peer}");
         return;
      }
      let links: Vec<_> = self
         .channels
         .links(peer)
         .map(|(link, c)| (link, c.cid))
         .collect();
      for (link, cid) in links {
         if let Err(e) = rebind_to_task(&self.ctx, peer, Channel::L2cap(cid)) {
            error!("remote: {link} channel of {peer} lost at commit: {e}");
            if link == RemoteLink::Control {
               self.channels.remove_peer(peer);
               return;
            }
            self.channels.remove(peer, link);
         }
      }
   }

   fn complete(&mut self, _becoming_primary: bool) {
      self.channels.settle();
      self.transfers.clear();
   }

   fn abort(&mut self) {
      self.channels.rollback();
      self.transfers.clear();
   }

   fn take_rejection(&mut self) -> Option<HandoverError> {
      self.transfers.take_rejection()
   }

   fn describe(&self) -> Value {
      let channels: Vec<_> = self
         .channels
         .iter()
         .map(|e| {
            json!({
               "peer": e.peer.to_string(),
               "link": e.link.to_string(),
               "state": e.conn.state.to_string(),
               "volume": e.conn.volume,
               "play_status": e.conn.play_status.to_string(),
               "notifications": format!("0x{:08x}", e.conn.notifications),
            })
         })
         .collect();
      json!(channels)
   }
}
