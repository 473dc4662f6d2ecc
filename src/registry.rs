//! Per-profile table of live connection instances.
//!
//! Each profile module owns one registry mapping a peer (and, for profiles
//! that open more than one channel per peer, a sub-link selector) to that
//! connection's live state. Capacity is fixed and lookups are linear scans.
//!
//! Entries created or overwritten by `allocate_if_absent` during an
//! unmarshal are journaled. `rollback` replays the journal backwards so an
//! aborted handover leaves the table exactly as it was; `settle` forgets the
//! journal once the handover is committed.

use crate::{
   error::{HandoverError, Result},
   peer::PeerIdentity,
};

/// Maximum connection instances a single profile tracks.
pub const MAX_LINKS: usize = 8;

/// One live connection instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<C, L> {
   pub peer: PeerIdentity,
   pub link: L,
   pub conn: C,
}

#[derive(Debug)]
enum Undo<C, L> {
   /// The entry did not exist before the handover.
   Remove { peer: PeerIdentity, link: L },
   /// The entry existed at `index`; this is its prior value.
   Restore { index: usize, entry: Entry<C, L> },
}

impl<C, L: PartialEq> Undo<C, L> {
   fn is_for(&self, peer: &PeerIdentity, link: &L) -> bool {
      match self {
         Self::Remove { peer: p, link: l } => p == peer && l == link,
         Self::Restore { entry, .. } => &entry.peer == peer && &entry.link == link,
      }
   }
}

/// Fixed-capacity connection table with an undo journal.
#[derive(Debug)]
pub struct Registry<C, L = ()> {
   entries: heapless::Vec<Entry<C, L>, MAX_LINKS>,
   journal: Vec<Undo<C, L>>,
}

impl<C, L> Default for Registry<C, L> {
   fn default() -> Self {
      Self {
         entries: heapless::Vec::new(),
         journal: Vec::new(),
      }
   }
}

impl<C, L: Copy + PartialEq> Registry<C, L> {
   pub fn new() -> Self {
      Self::default()
   }

   fn position(&self, peer: &PeerIdentity, link: &L) -> Option<usize> {
      self
         .entries
         .iter()
         .position(|e| &e.peer == peer && &e.link == link)
   }

   /// First connection instance for the peer, whatever its sub-link.
   pub fn find(&self, peer: &PeerIdentity) -> Option<&C> {
      self
         .entries
         .iter()
         .find(|e| &e.peer == peer)
         .map(|e| &e.conn)
   }

   pub fn find_link(&self, peer: &PeerIdentity, link: L) -> Option<&C> {
      self.position(peer, &link).map(|i| &self.entries[i].conn)
   }

   pub fn find_link_mut(&mut self, peer: &PeerIdentity, link: L) -> Option<&mut C> {
      self
         .position(peer, &link)
         .map(move |i| &mut self.entries[i].conn)
   }

   /// All instances belonging to the peer, in insertion order.
   pub fn links(&self, peer: &PeerIdentity) -> impl Iterator<Item = (L, &C)> + '_ {
      let peer = *peer;
      self
         .entries
         .iter()
         .filter(move |e| e.peer == peer)
         .map(|e| (e.link, &e.conn))
   }

   pub fn links_mut(&mut self, peer: &PeerIdentity) -> impl Iterator<Item = (L, &mut C)> + '_ {
      let peer = *peer;
      self
         .entries
         .iter_mut()
         .filter(move |e| e.peer == peer)
         .map(|e| (e.link, &mut e.conn))
   }

   pub fn contains(&self, peer: &PeerIdentity) -> bool {
      self.entries.iter().any(|e| &e.peer == peer)
   }

   /// Adds or replaces a locally established connection. Not journaled.
   pub fn insert(&mut self, peer: PeerIdentity, link: L, conn: C) -> Result<&mut C> {
      let index = match self.position(&peer, &link) {
         Some(i) => {
            self.entries[i].conn = conn;
            i
         },
         None => {
            self
               .entries
               .push(Entry { peer, link, conn })
               .map_err(|_| HandoverError::RegistryFull)?;
            self.entries.len() - 1
         },
      };
      Ok(&mut self.entries[index].conn)
   }

   pub fn remove(&mut self, peer: &PeerIdentity, link: L) -> Option<C> {
      let index = self.position(peer, &link)?;
      Some(self.entries.remove(index).conn)
   }

   /// Drops every instance of the peer, returning how many were removed.
   pub fn remove_peer(&mut self, peer: &PeerIdentity) -> usize {
      let before = self.entries.len();
      self.entries.retain(|e| &e.peer != peer);
      before - self.entries.len()
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }

   pub fn iter(&self) -> impl Iterator<Item = &Entry<C, L>> {
      self.entries.iter()
   }

   /// Distinct peers with at least one instance.
   pub fn peers(&self) -> heapless::Vec<PeerIdentity, MAX_LINKS> {
      let mut peers = heapless::Vec::new();
      for entry in &self.entries {
         if !peers.contains(&entry.peer) {
            let _ = peers.push(entry.peer);
         }
      }
      peers
   }

   /// Whether a handover has touched this table since the last settle.
   pub fn is_journaled(&self) -> bool {
      !self.journal.is_empty()
   }

   /// Forgets the journal. Called once a handover completes.
   pub fn settle(&mut self) {
      self.journal.clear();
   }
}

impl<C: Clone + Default, L: Copy + PartialEq> Registry<C, L> {
   /// Returns the instance for `(peer, link)`, creating a default one when
   /// absent. The first touch of each key is journaled.
   pub fn allocate_if_absent(&mut self, peer: PeerIdentity, link: L) -> Result<&mut C> {
      let journaled = self.journal.iter().any(|u| u.is_for(&peer, &link));
      let index = match self.position(&peer, &link) {
         Some(i) => {
            if !journaled {
               self.journal.push(Undo::Restore {
                  index: i,
                  entry: self.entries[i].clone(),
               });
            }
            i
         },
         None => {
            self
               .entries
               .push(Entry {
                  peer,
                  link,
                  conn: C::default(),
               })
               .map_err(|_| HandoverError::RegistryFull)?;
            if !journaled {
               self.journal.push(Undo::Remove { peer, link });
            }
            self.entries.len() - 1
         },
      };
      Ok(&mut self.entries[index].conn)
   }

   /// Drops the peer's instances whose link fails `keep`. Removals are
   /// journaled like allocations, so a rollback brings them back.
   pub fn retain_links(&mut self, peer: &PeerIdentity, mut keep: impl FnMut(&L) -> bool) {
      let mut i = 0;
      while i < self.entries.len() {
         let entry = &self.entries[i];
         if &entry.peer != peer || keep(&entry.link) {
            i += 1;
            continue;
         }
         if !self.journal.iter().any(|u| u.is_for(&entry.peer, &entry.link)) {
            self.journal.push(Undo::Restore {
               index: i,
               entry: entry.clone(),
            });
         }
         self.entries.remove(i);
      }
   }

   /// Undoes every journaled change, newest first.
   pub fn rollback(&mut self) {
      while let Some(undo) = self.journal.pop() {
         match undo {
            Undo::Remove { peer, link } => {
               self.entries.retain(|e| !(e.peer == peer && e.link == link));
            },
            Undo::Restore { index, entry } => match self.position(&entry.peer, &entry.link) {
               Some(i) => self.entries[i] = entry,
               None => {
                  let index = index.min(self.entries.len());
                  let _ = self.entries.insert(index, entry);
               },
            },
         }
      }
   }
}

impl<C: Clone, L: Clone> Clone for Registry<C, L> {
   fn clone(&self) -> Self {
      Self {
         entries: self.entries.clone(),
         journal: Vec::new(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::peer::BdAddr;

   fn peer(n: u8) -> PeerIdentity {
      PeerIdentity::bredr(BdAddr::new([0, 0, 0, 0, 0, n]))
   }

   #[test]
   fn test_allocate_creates_and_rollback_removes() {
      let mut reg: Registry<u32> = Registry::new();
      *reg.allocate_if_absent(peer(1), ()).unwrap() = 5;
      assert_eq!(reg.find(&peer(1)), Some(&5));
      assert!(reg.is_journaled());

      reg.rollback();
      assert!(reg.is_empty());
      assert!(!reg.is_journaled());
   }

   #[test]
   fn test_rollback_restores_prior_value() {
      let mut reg: Registry<u32, u8> = Registry::new();
      reg.insert(peer(1), 0, 10).unwrap();
      reg.insert(peer(1), 1, 11).unwrap();

      *reg.allocate_if_absent(peer(1), 1).unwrap() = 99;
      *reg.allocate_if_absent(peer(1), 1).unwrap() = 100;
      *reg.allocate_if_absent(peer(2), 0).unwrap() = 20;
      assert_eq!(reg.find_link(&peer(1), 1), Some(&100));
      assert_eq!(reg.len(), 3);

      reg.rollback();
      assert_eq!(reg.len(), 2);
      assert_eq!(reg.find_link(&peer(1), 0), Some(&10));
      assert_eq!(reg.find_link(&peer(1), 1), Some(&11));
      assert!(!reg.contains(&peer(2)));
   }

   #[test]
   fn test_retained_out_links_come_back_on_rollback() {
      let mut reg: Registry<u32, u8> = Registry::new();
      reg.insert(peer(1), 0, 10).unwrap();
      reg.insert(peer(1), 1, 11).unwrap();
      reg.insert(peer(2), 1, 21).unwrap();

      reg.retain_links(&peer(1), |link| *link == 0);
      assert_eq!(reg.len(), 2);
      assert!(reg.find_link(&peer(1), 1).is_none());
      assert_eq!(reg.find_link(&peer(2), 1), Some(&21));

      reg.rollback();
      assert_eq!(reg.find_link(&peer(1), 1), Some(&11));
      assert_eq!(reg.len(), 3);
   }

   #[test]
   fn test_rollback_keeps_entry_order() {
      let mut reg: Registry<u32, u8> = Registry::new();
      reg.insert(peer(1), 0, 10).unwrap();
      reg.insert(peer(1), 1, 11).unwrap();
      reg.insert(peer(2), 0, 20).unwrap();
      let before: Vec<_> = reg.iter().cloned().collect();

      *reg.allocate_if_absent(peer(1), 1).unwrap() = 99;
      reg.retain_links(&peer(1), |link| *link == 1);
      *reg.allocate_if_absent(peer(1), 2).unwrap() = 12;
      reg.rollback();

      let after: Vec<_> = reg.iter().cloned().collect();
      assert_eq!(after, before);
      assert_eq!(reg.find(&peer(1)), Some(&10));
   }

   #[test]
   fn test_settle_keeps_changes() {
      let mut reg: Registry<u32> = Registry::new();
      *reg.allocate_if_absent(peer(3), ()).unwrap() = 7;
      reg.settle();
      reg.rollback();
      assert_eq!(reg.find(&peer(3)), Some(&7));
   }

   #[test]
   fn test_capacity_is_enforced() {
      let mut reg: Registry<u8> = Registry::new();
      for n in 0..MAX_LINKS as u8 {
         reg.insert(peer(n), (), n).unwrap();
      }
      assert!(matches!(
         reg.allocate_if_absent(peer(200), ()),
         Err(HandoverError::RegistryFull)
      ));
      assert_eq!(reg.peers().len(), MAX_LINKS);
   }

   #[test]
   fn test_links_and_remove_peer() {
      let mut reg: Registry<&str, u8> = Registry::new();
      reg.insert(peer(1), 0, "signalling").unwrap();
      reg.insert(peer(1), 1, "media").unwrap();
      reg.insert(peer(2), 0, "signalling").unwrap();

      let links: Vec<_> = reg.links(&peer(1)).collect();
      assert_eq!(links, vec![(0, &"signalling"), (1, &"media")]);
      assert_eq!(reg.remove_peer(&peer(1)), 2);
      assert_eq!(reg.remove(&peer(2), 0), Some("signalling"));
      assert!(reg.is_empty());
   }
}
