//! Peer contacts announced for infohashes.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::common::messages::PEER_CONTACT_LEN;
use crate::common::{InfoHash, KNODES};

/// A set of peer contacts for one infohash, unique by their 6 byte binary
/// form. A rotation cursor makes successive reads return a different window
/// of contacts; each contact carries an alive flag cleared by [kill] and set
/// again on re-insert.
///
/// [kill]: PeerContactsSet::kill
#[derive(Debug, Default)]
struct PeerContactsSet {
    /// Contact bytes mapped to the alive flag.
    set: HashMap<Vec<u8>, bool>,
    /// Rotation order. The front is the cursor.
    ring: VecDeque<Vec<u8>>,
}

impl PeerContactsSet {
    /// Up to [KNODES] alive contacts, advancing the rotation cursor so that
    /// further calls return a different window, if possible.
    fn next(&mut self) -> Vec<Vec<u8>> {
        let count = KNODES.min(self.set.len());
        let mut picked: Vec<Vec<u8>> = Vec::with_capacity(count);

        for sweep in 0..2 {
            let mut visited = 0;
            while visited < self.ring.len() && picked.len() < count {
                self.ring.rotate_left(1);
                visited += 1;
                let contact = self.ring.front().expect("ring is non-empty");
                if self.set.get(contact) == Some(&true) && !picked.contains(contact) {
                    picked.push(contact.clone());
                }
            }
            if sweep == 0 && picked.len() >= count {
                break;
            }
        }
        picked
    }

    /// Add a contact. Contacts shorter than 6 bytes and duplicates of alive
    /// contacts are rejected; re-adding a dead contact revives it.
    fn put(&mut self, contact: &[u8]) -> bool {
        if contact.len() < PEER_CONTACT_LEN {
            return false;
        }
        match self.set.get_mut(contact) {
            Some(alive) if *alive => false,
            Some(alive) => {
                *alive = true;
                true
            }
            None => {
                self.set.insert(contact.to_vec(), true);
                self.ring.push_back(contact.to_vec());
                true
            }
        }
    }

    /// Make room by dropping the first dead contact, or the cursor-next
    /// contact when none is dead. Returns the dropped contact.
    fn drop_one(&mut self) -> Option<Vec<u8>> {
        if let Some(dead) = self.drop_dead() {
            return Some(dead);
        }
        self.ring.rotate_left(1);
        let contact = self.ring.pop_front()?;
        self.set.remove(&contact);
        Some(contact)
    }

    fn drop_dead(&mut self) -> Option<Vec<u8>> {
        for _ in 0..self.ring.len() {
            self.ring.rotate_left(1);
            let contact = self.ring.front().expect("ring is non-empty");
            if self.set.get(contact) == Some(&false) {
                let contact = self.ring.pop_front().expect("front exists");
                self.set.remove(&contact);
                return Some(contact);
            }
        }
        None
    }

    fn kill(&mut self, contact: &[u8]) {
        if let Some(alive) = self.set.get_mut(contact) {
            *alive = false;
        }
    }

    fn contains(&self, contact: &[u8]) -> bool {
        self.set.contains_key(contact)
    }

    /// The number of contacts known, dead ones included.
    fn size(&self) -> usize {
        self.set.len()
    }

    fn alive(&self) -> usize {
        self.set.values().filter(|alive| **alive).count()
    }
}

/// An LRU over infohashes, each holding a bounded [PeerContactsSet], plus
/// the map of infohashes this node itself is downloading.
#[derive(Debug)]
pub struct PeerStore {
    /// Cache of contacts per infohash. The least recently used infohash is
    /// evicted when the cache is full.
    info_hash_peers: LruCache<InfoHash, PeerContactsSet>,
    /// Infohashes for which we are a peer, mapped to the local TCP port.
    local_active_downloads: HashMap<InfoHash, u16>,
    max_info_hash_peers: usize,
}

impl PeerStore {
    pub fn new(max_info_hashes: usize, max_info_hash_peers: usize) -> PeerStore {
        PeerStore {
            info_hash_peers: LruCache::new(
                NonZeroUsize::new(max_info_hashes.max(1)).expect("capacity is non-zero"),
            ),
            local_active_downloads: HashMap::new(),
            max_info_hash_peers,
        }
    }

    // === Public Methods ===

    /// Store `contact` as a peer for `info_hash`. Returns whether the
    /// contact was actually stored.
    pub fn add_contact(&mut self, info_hash: InfoHash, contact: &[u8]) -> bool {
        if let Some(peers) = self.info_hash_peers.get_mut(&info_hash) {
            if peers.size() >= self.max_info_hash_peers {
                if peers.contains(contact) {
                    return peers.put(contact);
                }
                if peers.drop_one().is_none() {
                    return false;
                }
            }
            return peers.put(contact);
        }

        let mut peers = PeerContactsSet::default();
        let stored = peers.put(contact);
        self.info_hash_peers.put(info_hash, peers);
        stored
    }

    /// A rotating window of up to 8 alive contacts for `info_hash`.
    pub fn peer_contacts(&mut self, info_hash: &InfoHash) -> Vec<Vec<u8>> {
        self.info_hash_peers
            .get_mut(info_hash)
            .map(PeerContactsSet::next)
            .unwrap_or_default()
    }

    /// Mark `contact` dead in every set of an infohash we actively download.
    /// The contact is not removed; a later successful re-insert revives it.
    pub fn kill_contact(&mut self, contact: &[u8]) {
        let downloads: Vec<InfoHash> = self.local_active_downloads.keys().copied().collect();
        for info_hash in downloads {
            if let Some(peers) = self.info_hash_peers.get_mut(&info_hash) {
                peers.kill(contact);
            }
        }
    }

    /// The number of contacts known for `info_hash`, dead ones included.
    pub fn count(&self, info_hash: &InfoHash) -> usize {
        self.info_hash_peers
            .peek(info_hash)
            .map_or(0, PeerContactsSet::size)
    }

    /// The number of alive contacts known for `info_hash`.
    pub fn alive(&self, info_hash: &InfoHash) -> usize {
        self.info_hash_peers
            .peek(info_hash)
            .map_or(0, PeerContactsSet::alive)
    }

    pub fn add_local_download(&mut self, info_hash: InfoHash, port: u16) {
        self.local_active_downloads.insert(info_hash, port);
    }

    pub fn remove_local_download(&mut self, info_hash: &InfoHash) {
        self.local_active_downloads.remove(info_hash);
    }

    /// The local TCP port declared for `info_hash`, when we download it.
    pub fn has_local_download(&self, info_hash: &InfoHash) -> Option<u16> {
        self.local_active_downloads.get(info_hash).copied()
    }

    pub fn local_downloads(&self) -> Vec<InfoHash> {
        self.local_active_downloads.keys().copied().collect()
    }
}
