//! Audio stream control: the signalling channel and its media channel.
//!
//! A peer has at most one signalling channel and one media channel. The
//! media channel belongs to the signalling channel; a media snapshot that
//! arrives without its signalling channel is rejected. While audio is
//! playing the media channel carries a streaming sub-state (bit rate and
//! media MTU), which is what routes it to the audio path at commit.

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
   codec::{Codec, Convert, Snapshot, Step, Transfer, convert_repr},
   error::{HandoverError, Result},
   handover::{
      ProfileContext, ProfileHandover, ProfileId,
      rebind::{self, rebind},
      transfer::Transfers,
   },
   link::{Channel, Destination, HandoverPolicy},
   peer::PeerIdentity,
   profiles::ChannelState,
   registry::Registry,
};

/// Which of a peer's two channels an entry describes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamLink {
   #[default]
   Signalling = 0,
   Media = 1,
}

/// Stream endpoint state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::FromRepr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SepState {
   #[default]
   Idle = 0,
   Configured = 1,
   Open = 2,
   Streaming = 3,
   Closing = 4,
   Aborting = 5,
}

convert_repr!(StreamLink, SepState);

/// Present while audio is flowing on a media channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Streaming {
   pub bit_rate: u32,
   pub mtu: u16,
}

impl Convert for Streaming {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.bit_rate)?;
      codec.convert(&mut self.mtu)
   }
}

/// One stream control channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AvChannel {
   pub state: ChannelState,
   pub cid: u16,
   pub mtu: u16,
   pub version: u16,
   /// Channel was opened by the peer.
   pub inbound: bool,
   pub sep: SepState,
   pub local_seid: u8,
   pub remote_seid: u8,
   pub streaming: Option<Streaming>,
   /// Outstanding signalling transaction label. Never transferred.
   #[serde(skip)]
   pub pending_label: Option<u8>,
}

impl Convert for AvChannel {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.state)?;
      codec.convert(&mut self.cid)?;
      codec.convert(&mut self.mtu)?;
      codec.convert(&mut self.version)?;
      codec.convert(&mut self.inbound)?;
      codec.convert(&mut self.sep)?;
      codec.convert(&mut self.local_seid)?;
      codec.convert(&mut self.remote_seid)?;
      codec.convert(&mut self.streaming)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvLinkSnapshot {
   pub link: StreamLink,
   pub channel: AvChannel,
}

impl Convert for AvLinkSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.link)?;
      codec.convert(&mut self.channel)
   }
}

/// Every stream control channel of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvSnapshot {
   pub links: heapless::Vec<AvLinkSnapshot, 2>,
}

impl Convert for AvSnapshot {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.convert(&mut self.links)
   }
}

impl Snapshot for AvSnapshot {
   const SCHEMA: u8 = 1;
}

/// Stream control handover module.
pub struct StreamControl {
   ctx: ProfileContext,
   channels: Registry<AvChannel, StreamLink>,
   transfers: Transfers<AvSnapshot>,
}

impl StreamControl {
   pub fn new(ctx: ProfileContext) -> Self {
      Self {
         ctx,
         channels: Registry::new(),
         transfers: Transfers::new(),
      }
   }

   /// Records a connected signalling channel.
   pub fn signalling_connected(
      &mut self,
      peer: PeerIdentity,
      cid: u16,
      mtu: u16,
      inbound: bool,
   ) -> Result<()> {
      self.channels.insert(peer, StreamLink::Signalling, AvChannel {
         state: ChannelState::Connected,
         cid,
         mtu,
         version: 0x0103,
         inbound,
         ..Default::default()
      })?;
      info!("Stream signalling up for {peer} on cid 0x{cid:04x}");
      Ok(())
   }

   /// Records an opened media channel and allows it to be handed over while
   /// streaming.
   pub fn media_opened(&mut self, peer: PeerIdentity, cid: u16, mtu: u16) -> Result<()> {
      let Some(signalling) = self.channels.find_link_mut(&peer, StreamLink::Signalling) else {
         return Err(HandoverError::PeerNotConnected(peer));
      };
      signalling.sep = SepState::Open;
      signalling.local_seid = 1;
      signalling.remote_seid = 1;
      self.channels.insert(peer, StreamLink::Media, AvChannel {
         state: ChannelState::Connected,
         cid,
         mtu,
         sep: SepState::Open,
         ..Default::default()
      })?;

      let mut links = self.ctx.links.lock();
      if let Some(stream) = links.stream(&peer, Channel::L2cap(cid))
         && let Err(e) = links.set_handover_policy(stream, HandoverPolicy::Allow)
      {
         warn!("Could not allow handover of media stream for {peer}: {e}");
      }
      Ok(())
   }

   pub fn start_streaming(&mut self, peer: &PeerIdentity, bit_rate: u32, mtu: u16) {
      for (link, channel) in self.channels.links_mut(peer) {
         channel.sep = SepState::Streaming;
         if link == StreamLink::Media {
            channel.streaming = Some(Streaming { bit_rate, mtu });
         }
      }
   }

   /// Marks a signalling transaction as outstanding (or answered).
   pub fn set_pending_label(&mut self, peer: &PeerIdentity, label: Option<u8>) {
      if let Some(signalling) = self.channels.find_link_mut(peer, StreamLink::Signalling) {
         signalling.pending_label = label;
      }
   }

   pub fn set_sep_state(&mut self, peer: &PeerIdentity, sep: SepState) {
      if let Some(signalling) = self.channels.find_link_mut(peer, StreamLink::Signalling) {
         signalling.sep = sep;
      }
   }

   pub fn disconnected(&mut self, peer: &PeerIdentity) {
      if self.channels.remove_peer(peer) > 0 {
         info!("Stream control down for {peer}");
      }
   }

   pub fn channel(&self, peer: &PeerIdentity, link: StreamLink) -> Option<&AvChannel> {
      self.channels.find_link(peer, link)
   }

   pub fn is_streaming(&self, peer: &PeerIdentity) -> bool {
      self
         .channels
         .find_link(peer, StreamLink::Media)
         .is_some_and(|m| m.streaming.is_some())
   }
}

fn capture(channels: &Registry<AvChannel, StreamLink>, peer: &PeerIdentity) -> Option<AvSnapshot> {
   let mut snapshot = AvSnapshot::default();
   for (link, channel) in channels.links(peer) {
      let _ = snapshot.links.push(AvLinkSnapshot {
         link,
         channel: AvChannel {
            pending_label: None,
            ..channel.clone()
         },
      });
   }
   (!snapshot.links.is_empty()).then_some(snapshot)
}

fn apply(
   channels: &mut Registry<AvChannel, StreamLink>,
   peer: &PeerIdentity,
   snapshot: AvSnapshot,
) -> Result<()> {
   let has_signalling = snapshot
      .links
      .iter()
      .any(|l| l.link == StreamLink::Signalling);
   if !has_signalling {
      return Err(HandoverError::MissingParent {
         peer: *peer,
         profile: ProfileId::StreamControl,
         parent: "signalling channel",
      });
   }
   for entry in &snapshot.links {
      *channels.allocate_if_absent(*peer, entry.link)? = entry.channel.clone();
   }
   channels.retain_links(peer, |link| snapshot.links.iter().any(|l| l.link == *link));
   Ok(())
}

impl ProfileHandover for StreamControl {
   fn id(&self) -> ProfileId {
      ProfileId::StreamControl
   }

   fn veto(&self, peer: &PeerIdentity) -> bool {
      for (link, channel) in self.channels.links(peer) {
         if channel.state.is_transient() {
            debug!("stream: {link} channel of {peer} is {}", channel.state);
            return true;
         }
         if matches!(channel.sep, SepState::Closing | SepState::Aborting) {
            debug!("stream: endpoint of {peer} is {}", channel.sep);
            return true;
         }
         if let Some(label) = channel.pending_label {
            debug!("stream: transaction {label} outstanding for {peer}");
            return true;
         }
         if link == StreamLink::Media
            && channel.streaming.is_some()
            && rebind::policy(&self.ctx, peer, Channel::L2cap(channel.cid))
               != Some(HandoverPolicy::Allow)
         {
            debug!("stream: media of {peer} streaming without handover policy");
            return true;
         }
      }
      self.ctx.has_pending(peer)
   }

   fn marshal(&mut self, peer: &PeerIdentity, window: &mut [u8]) -> Transfer {
      let channels = &self.channels;
      self
         .transfers
         .marshal(ProfileId::StreamControl, peer, window, |p| capture(channels, p))
   }

   fn unmarshal(&mut self, peer: &PeerIdentity, window: &[u8]) -> Transfer {
      let channels = &mut self.channels;
      self
         .transfers
         .unmarshal(ProfileId::StreamControl, peer, window, |p, snapshot| {
            apply(channels, p, snapshot)
         })
   }

   fn commit(&mut self, peer: &PeerIdentity, becoming_primary: bool) {
      if !becoming_primary {
         // the channels now live on the other earbud
         let released = self.channels.remove_peer(peer);
         debug!("stream: released {released} channel(s) of {peer}");
         return;
      }
      let links: Vec<_> = self
         .channels
         .links(peer)
         .map(|(link, c)| (link, c.cid, c.streaming.is_some()))
         .collect();
      for (link, cid, streaming) in links {
         let destination = match link {
            StreamLink::Signalling => Destination::Task(self.ctx.task),
            StreamLink::Media if streaming => Destination::AudioPath,
            StreamLink::Media => Destination::Dispose,
         };
         if let Err(e) = rebind(&self.ctx, peer, Channel::L2cap(cid), destination) {
            error!("stream: {link} channel of {peer} lost at commit: {e}");
            match link {
               StreamLink::Signalling => {
                  self.channels.remove_peer(peer);
                  return;
               },
               StreamLink::Media => {
                  self.channels.remove(peer, link);
               },
            }
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
               "cid": e.conn.cid,
               "sep": e.conn.sep.to_string(),
               "streaming": e.conn.streaming,
            })
         })
         .collect();
      json!(channels)
   }
}
