//! Stream re-registration performed by the earbud becoming primary.
//!
//! After the radio links move, the streams of a handed-over connection exist
//! on the new primary but belong to nobody. Rebinding looks each one up,
//! gives it to the profile's task, allows it to be handed over again, and
//! connects its data path. Allowing handover here is what lets the next
//! veto pass while the stream is busy.

use log::debug;

use crate::{
   handover::ProfileContext,
   link::{Channel, Destination, HandoverPolicy, RebindError, StreamId},
   peer::PeerIdentity,
};

/// Rebinds the stream carrying `channel` to the context's task and connects
/// it to `destination`.
pub fn rebind(
   ctx: &ProfileContext,
   peer: &PeerIdentity,
   channel: Channel,
   destination: Destination,
) -> Result<StreamId, RebindError> {
   let mut links = ctx.links.lock();
   let stream = links
      .stream(peer, channel)
      .ok_or(RebindError::NoStream {
         peer: *peer,
         channel,
      })?;
   links.rebind(stream, ctx.task)?;
   links.set_handover_policy(stream, HandoverPolicy::Allow)?;
   links.connect(stream, destination)?;
   debug!("{peer}: {channel} → {stream} owned by {}, connected to {destination:?}", ctx.task);
   Ok(stream)
}

/// Rebinds the stream to the context's own task.
pub fn rebind_to_task(
   ctx: &ProfileContext,
   peer: &PeerIdentity,
   channel: Channel,
) -> Result<StreamId, RebindError> {
   rebind(ctx, peer, channel, Destination::Task(ctx.task))
}

/// Current handover policy of the stream carrying `channel`, if it exists.
pub fn policy(ctx: &ProfileContext, peer: &PeerIdentity, channel: Channel) -> Option<HandoverPolicy> {
   let links = ctx.links.lock();
   links
      .stream(peer, channel)
      .and_then(|stream| links.handover_policy(stream))
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{handover::testing, runtime::TaskId};

   #[test]
   fn test_rebind_sets_owner_policy_and_destination() {
      let (ctx, links) = testing::context(TaskId::StreamControl);
      let peer = testing::peer();
      links
         .lock()
         .open(peer, Channel::L2cap(0x41), TaskId::Application);

      let stream = rebind(&ctx, &peer, Channel::L2cap(0x41), Destination::AudioPath).unwrap();
      let binding = links.lock().binding(stream).cloned().unwrap();
      assert_eq!(binding.owner, Some(TaskId::StreamControl));
      assert_eq!(binding.policy, HandoverPolicy::Allow);
      assert_eq!(binding.destination, Some(Destination::AudioPath));
      assert_eq!(
         policy(&ctx, &peer, Channel::L2cap(0x41)),
         Some(HandoverPolicy::Allow)
      );
   }

   #[test]
   fn test_missing_stream_fails() {
      let (ctx, _links) = testing::context(TaskId::SerialPort);
      let peer = testing::peer();
      assert_eq!(
         rebind_to_task(&ctx, &peer, Channel::Rfcomm(2)),
         Err(RebindError::NoStream {
            peer,
            channel: Channel::Rfcomm(2),
         })
      );
      assert_eq!(policy(&ctx, &peer, Channel::Rfcomm(2)), None);
   }
}
