//! Cooperative message runtime shared by the profile modules.
//!
//! Profiles run as tasks on a single cooperative scheduler. Every task has a
//! FIFO of messages; a handover must not start while a task still holds a
//! message for the peer being moved, since that message would be processed
//! against state that has already been marshalled.

use std::{
   collections::{HashMap, VecDeque},
   sync::Arc,
};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::peer::PeerIdentity;

/// Small inline payload, sized for typical signalling PDUs.
pub type Packet = SmallVec<[u8; 32]>;

/// Identifier of a task on the scheduler.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
pub enum TaskId {
   ConnectionManager,
   StreamControl,
   RemoteControl,
   ServiceDiscovery,
   ScanServer,
   ObjectExchange,
   SerialPort,
   CapabilityServer,
   AudioPath,
   Application,
}

/// Kinds of message queued for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
   ConnectInd,
   DisconnectInd,
   /// A link power-mode change reported but not yet handled.
   ModeChange,
   Data(Packet),
   Timer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
   pub peer: Option<PeerIdentity>,
   pub kind: MessageKind,
}

impl Message {
   pub const fn new(peer: Option<PeerIdentity>, kind: MessageKind) -> Self {
      Self { peer, kind }
   }

   pub const fn for_peer(peer: PeerIdentity, kind: MessageKind) -> Self {
      Self::new(Some(peer), kind)
   }
}

/// Shared handle to the per-task message queues. Cheaply cloneable.
#[derive(Debug, Clone, Default)]
pub struct Scheduler(Arc<Mutex<HashMap<TaskId, VecDeque<Message>>>>);

impl Scheduler {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn post(&self, task: TaskId, message: Message) {
      debug!("post {task}: {message:?}");
      self.0.lock().entry(task).or_default().push_back(message);
   }

   /// Number of messages waiting for the task.
   pub fn pending(&self, task: TaskId) -> usize {
      self.0.lock().get(&task).map_or(0, VecDeque::len)
   }

   /// Whether the task has any message concerning the peer.
   pub fn pending_for(&self, task: TaskId, peer: &PeerIdentity) -> bool {
      self
         .0
         .lock()
         .get(&task)
         .is_some_and(|q| q.iter().any(|m| m.peer.as_ref() == Some(peer)))
   }

   pub fn pop(&self, task: TaskId) -> Option<Message> {
      self.0.lock().get_mut(&task)?.pop_front()
   }

   /// Drains every queue, handing each message to `handler`.
   /// Returns the number of messages processed.
   pub fn dispatch_all(&self, mut handler: impl FnMut(TaskId, Message)) -> usize {
      let drained: Vec<_> = {
         let mut queues = self.0.lock();
         queues
            .iter_mut()
            .flat_map(|(task, q)| q.drain(..).map(|m| (*task, m)).collect::<Vec<_>>())
            .collect()
      };
      let count = drained.len();
      for (task, message) in drained {
         handler(task, message);
      }
      count
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::peer::BdAddr;

   #[test]
   fn test_pending_for_peer() {
      let sched = Scheduler::new();
      let a = PeerIdentity::bredr(BdAddr::new([1; 6]));
      let b = PeerIdentity::bredr(BdAddr::new([2; 6]));

      sched.post(TaskId::StreamControl, Message::for_peer(a, MessageKind::Timer));
      sched.post(TaskId::StreamControl, Message::new(None, MessageKind::Timer));

      assert_eq!(sched.pending(TaskId::StreamControl), 2);
      assert!(sched.pending_for(TaskId::StreamControl, &a));
      assert!(!sched.pending_for(TaskId::StreamControl, &b));
      assert!(!sched.pending_for(TaskId::RemoteControl, &a));
   }

   #[test]
   fn test_dispatch_drains_everything() {
      let sched = Scheduler::new();
      let a = PeerIdentity::le(BdAddr::new([3; 6]));
      sched.post(TaskId::ConnectionManager, Message::for_peer(a, MessageKind::ModeChange));
      sched.post(
         TaskId::SerialPort,
         Message::for_peer(a, MessageKind::Data(Packet::from_slice(b"AT"))),
      );

      let mut seen = Vec::new();
      assert_eq!(sched.dispatch_all(|task, _| seen.push(task)), 2);
      seen.sort();
      assert_eq!(seen, vec![TaskId::ConnectionManager, TaskId::SerialPort]);
      assert!(sched.pop(TaskId::SerialPort).is_none());
   }
}
