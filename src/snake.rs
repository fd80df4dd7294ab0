//! Virtual snake overlay: a keyspace DHT built over the spanning tree.
//!
//! Every node tries to hold a path to its keyspace predecessor
//! (*descending*) and successor (*ascending*). Paths are discovered by
//! bootstrap frames routed towards the sender's own key and installed by
//! the bootstrap-ACK travelling back along tree coordinates; each hop on
//! the way records forwarding state keyed by `(owner key, path id)`.
//! Frames routed by key walk downhill onto their destination: each hop
//! hands the frame to the candidate whose key sits closest above the
//! target.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::crypto::{self, Identity};
use crate::error::WireError;
use crate::types::{
    decode_varu64, encode_varu64, keyspace_ordered, Coordinates, PathId, Port, PublicKey,
    PATH_ID_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};

/// Key of one installed snake path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SnakeIndex {
    pub public_key: PublicKey,
    pub path_id: PathId,
}

/// Forwarding state for one snake path at one router.
///
/// `source_port` faces the path owner (the bootstrapping, lower-key end);
/// `destination_port` faces the owner's ascending target. Port 0 marks an
/// endpoint.
#[derive(Clone, Debug)]
pub(crate) struct SnakeEntry {
    pub origin: PublicKey,
    pub target: PublicKey,
    pub source_port: Port,
    pub destination_port: Port,
    pub root_public_key: PublicKey,
    pub root_sequence: u64,
    pub last_seen: Instant,
}

/// Tree facts the snake needs for a next-hop decision, extracted from the
/// tree state by the router actor.
pub(crate) struct TreeView {
    pub root_public_key: PublicKey,
    pub parent: Option<Port>,
    /// Ancestor chain keys, root first, excluding ourselves.
    pub ancestors: Vec<PublicKey>,
    /// Usable peers sharing our root, in ascending port order.
    pub peers: Vec<(Port, PublicKey)>,
}

pub(crate) struct SnakeState {
    our_key: PublicKey,
    ascending: Option<SnakeIndex>,
    descending: Option<SnakeIndex>,
    table: HashMap<SnakeIndex, SnakeEntry>,
    path_timeout: Duration,
}

impl SnakeState {
    pub fn new(our_key: PublicKey, path_timeout: Duration) -> Self {
        Self {
            our_key,
            ascending: None,
            descending: None,
            table: HashMap::new(),
            path_timeout,
        }
    }

    pub fn ascending(&self) -> Option<&SnakeIndex> {
        self.ascending.as_ref()
    }

    pub fn descending(&self) -> Option<&SnakeIndex> {
        self.descending.as_ref()
    }

    pub fn entry(&self, index: &SnakeIndex) -> Option<&SnakeEntry> {
        self.table.get(index)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SnakeIndex, &SnakeEntry)> {
        self.table.iter()
    }

    fn entry_usable(&self, entry: &SnakeEntry, root: &PublicKey, now: Instant) -> bool {
        entry.root_public_key == *root
            && now.duration_since(entry.last_seen) < self.path_timeout
    }

    /// Install a path entry. Idempotent per index: re-installing the same
    /// path overwrites in place (refreshing freshness, and adopting new
    /// ports if the route moved) rather than duplicating. Returns true
    /// when the entry is new.
    pub fn install(&mut self, index: SnakeIndex, entry: SnakeEntry) -> bool {
        self.table.insert(index, entry).is_none()
    }

    /// Remove a path entry, clearing any neighbour slot pointing at it.
    pub fn remove(&mut self, index: &SnakeIndex) -> Option<SnakeEntry> {
        if self.ascending.as_ref() == Some(index) {
            self.ascending = None;
        }
        if self.descending.as_ref() == Some(index) {
            self.descending = None;
        }
        self.table.remove(index)
    }

    /// Drain every installed path (root change).
    pub fn clear(&mut self) -> Vec<(SnakeIndex, SnakeEntry)> {
        self.ascending = None;
        self.descending = None;
        self.table.drain().collect()
    }

    /// Paths whose forwarding state references the given port.
    pub fn paths_via_port(&self, port: Port) -> Vec<SnakeIndex> {
        self.table
            .iter()
            .filter(|(_, e)| e.source_port == port || e.destination_port == port)
            .map(|(idx, _)| *idx)
            .collect()
    }

    /// Paths that have outlived the path timeout.
    pub fn expired(&self, now: Instant) -> Vec<SnakeIndex> {
        self.table
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) >= self.path_timeout)
            .map(|(idx, _)| *idx)
            .collect()
    }

    /// Entries counted stale for the introspection surface: a root key or
    /// sequence behind the current announcement, or a duplicate owner key.
    pub fn stale_count(&self, root: &PublicKey, root_sequence: u64) -> usize {
        let mut dupes: HashMap<PublicKey, usize> = HashMap::new();
        for index in self.table.keys() {
            *dupes.entry(index.public_key).or_default() += 1;
        }
        self.table
            .iter()
            .filter(|(idx, e)| {
                dupes[&idx.public_key] > 1
                    || e.root_public_key != *root
                    || e.root_sequence != root_sequence
            })
            .count()
    }

    /// Would `candidate` make a better descending neighbour than the
    /// current one?
    pub fn accepts_descending(
        &self,
        candidate: &PublicKey,
        root: &PublicKey,
        now: Instant,
    ) -> bool {
        if *candidate == self.our_key {
            return false;
        }
        let current = self
            .descending
            .as_ref()
            .and_then(|idx| self.table.get(idx).map(|e| (idx, e)));
        match current {
            Some((idx, entry)) if self.entry_usable(entry, root, now) => {
                idx.public_key == *candidate
                    || keyspace_ordered(&idx.public_key, candidate, &self.our_key)
            }
            _ => true,
        }
    }

    /// Would `candidate` make a better ascending neighbour than the
    /// current one?
    pub fn accepts_ascending(
        &self,
        candidate: &PublicKey,
        root: &PublicKey,
        now: Instant,
    ) -> bool {
        if *candidate == self.our_key {
            return false;
        }
        let current = self
            .ascending
            .as_ref()
            .and_then(|idx| self.table.get(idx).map(|e| (idx, e)));
        match current {
            Some((_, entry)) if self.entry_usable(entry, root, now) => {
                entry.target == *candidate
                    || keyspace_ordered(&self.our_key, candidate, &entry.target)
            }
            _ => true,
        }
    }

    /// While the ascending path is healthy, periodic bootstraps reuse its
    /// path id so every hop just refreshes instead of tearing down and
    /// reinstalling.
    pub fn refresh_path_id(&self, root: &PublicKey, now: Instant) -> Option<PathId> {
        let index = self.ascending.as_ref()?;
        let entry = self.table.get(index)?;
        self.entry_usable(entry, root, now)
            .then_some(index.path_id)
    }

    /// Point the descending slot at an installed path.
    pub fn set_descending(&mut self, index: SnakeIndex) -> Option<SnakeIndex> {
        self.descending.replace(index)
    }

    /// Point the ascending slot at an installed path.
    pub fn set_ascending(&mut self, index: SnakeIndex) -> Option<SnakeIndex> {
        self.ascending.replace(index)
    }

    /// Pick the next hop for a key-routed frame. Port 0 means "terminate
    /// here": exact delivery, closest-predecessor delivery, or — for a
    /// bootstrap — this node is the candidate successor.
    pub fn next_hop(
        &self,
        destination: &PublicKey,
        bootstrap: bool,
        view: &TreeView,
        now: Instant,
    ) -> Port {
        if !bootstrap && *destination == self.our_key {
            return 0;
        }

        let mut best_key = self.our_key;
        let mut best_port: Port = 0;

        let consider = |key: PublicKey, port: Port, best_key: &mut PublicKey, best_port: &mut Port| {
            if *best_key == *destination {
                // An exact match is never displaced.
                return;
            }
            if key == *destination {
                // A bootstrap must land on the destination's successor,
                // never travel back to the destination key itself.
                if !bootstrap {
                    *best_key = key;
                    *best_port = port;
                }
            } else if keyspace_ordered(destination, &key, best_key) {
                *best_key = key;
                *best_port = port;
            }
        };

        // Walk towards the root when the destination sits above us.
        if let Some(parent) = view.parent {
            let climb = if bootstrap {
                // Bootstraps climb only to escape their own sender; for a
                // root-keyed bootstrap the wrap-around walk below finds the
                // successor instead.
                best_key == *destination
            } else {
                *destination == view.root_public_key
                    || keyspace_ordered(&best_key, destination, &view.root_public_key)
            };
            if climb && best_key != view.root_public_key {
                best_key = view.root_public_key;
                best_port = parent;
            }
            for ancestor in &view.ancestors {
                consider(*ancestor, parent, &mut best_key, &mut best_port);
            }
        }

        // Direct peers.
        for (port, key) in &view.peers {
            consider(*key, *port, &mut best_key, &mut best_port);
        }

        // Installed snake paths, both directions, deterministically ordered
        // so equal keys tie-break on the lower port and freshest entry.
        let mut candidates: Vec<(PublicKey, Port, Instant)> = Vec::new();
        for entry in self.table.values() {
            if !self.entry_usable(entry, &view.root_public_key, now) {
                continue;
            }
            if entry.source_port != 0 {
                candidates.push((entry.origin, entry.source_port, entry.last_seen));
            }
            if entry.destination_port != 0 {
                candidates.push((entry.target, entry.destination_port, entry.last_seen));
            }
        }
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));
        let usable: HashSet<Port> = view.peers.iter().map(|(p, _)| *p).collect();
        for (key, port, _) in candidates {
            if usable.contains(&port) || Some(port) == view.parent {
                consider(key, port, &mut best_key, &mut best_port);
            }
        }

        best_port
    }
}

// ── Protocol payloads ────────────────────────────────────────────────

/// Contents of a bootstrap frame's payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BootstrapPayload {
    pub path_id: PathId,
    pub sequence: u64,
    pub root_public_key: PublicKey,
    pub root_sequence: u64,
    pub source_coords: Coordinates,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl BootstrapPayload {
    fn signed_bytes(&self, destination_key: &PublicKey) -> Vec<u8> {
        let mut message = Vec::with_capacity(128);
        message.extend_from_slice(&self.path_id.0);
        encode_varu64(self.sequence, &mut message);
        message.extend_from_slice(&self.root_public_key.0);
        encode_varu64(self.root_sequence, &mut message);
        self.source_coords.marshal_to(&mut message);
        message.extend_from_slice(&destination_key.0);
        message
    }

    /// Sign with the bootstrapping identity; the signature binds the
    /// frame's destination key (the bootstrapper's own).
    pub fn sign(&mut self, identity: &Identity) {
        self.signature = identity.sign(&self.signed_bytes(&identity.public_key));
    }

    pub fn verify(&self, destination_key: &PublicKey) -> bool {
        crypto::verify(
            destination_key,
            &self.signed_bytes(destination_key),
            &self.signature,
        )
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.path_id.0);
        encode_varu64(self.sequence, &mut out);
        out.extend_from_slice(&self.root_public_key.0);
        encode_varu64(self.root_sequence, &mut out);
        self.source_coords.marshal_to(&mut out);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<BootstrapPayload, WireError> {
        let mut offset = 0;
        let path_id = read_path_id(data, &mut offset)?;
        let (sequence, n) = decode_varu64(&data[offset..])?;
        offset += n;
        let root_public_key = read_key(data, &mut offset)?;
        let (root_sequence, n) = decode_varu64(&data[offset..])?;
        offset += n;
        let (source_coords, n) = Coordinates::unmarshal(&data[offset..])?;
        offset += n;
        let signature = read_signature(data, &mut offset)?;
        if offset != data.len() {
            return Err(WireError::InconsistentLength);
        }
        Ok(BootstrapPayload {
            path_id,
            sequence,
            root_public_key,
            root_sequence,
            source_coords,
            signature,
        })
    }
}

/// Contents of a bootstrap-ACK frame's payload. `destination_key` is the
/// bootstrapping path owner, `source_key` the responder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BootstrapAckPayload {
    pub path_id: PathId,
    pub sequence: u64,
    pub destination_key: PublicKey,
    pub source_key: PublicKey,
    pub root_public_key: PublicKey,
    pub root_sequence: u64,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl BootstrapAckPayload {
    fn signed_bytes(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(160);
        message.extend_from_slice(&self.path_id.0);
        encode_varu64(self.sequence, &mut message);
        message.extend_from_slice(&self.destination_key.0);
        message.extend_from_slice(&self.source_key.0);
        message.extend_from_slice(&self.root_public_key.0);
        encode_varu64(self.root_sequence, &mut message);
        message
    }

    pub fn sign(&mut self, identity: &Identity) {
        self.signature = identity.sign(&self.signed_bytes());
    }

    pub fn verify(&self) -> bool {
        crypto::verify(&self.source_key, &self.signed_bytes(), &self.signature)
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<BootstrapAckPayload, WireError> {
        let mut offset = 0;
        let path_id = read_path_id(data, &mut offset)?;
        let (sequence, n) = decode_varu64(&data[offset..])?;
        offset += n;
        let destination_key = read_key(data, &mut offset)?;
        let source_key = read_key(data, &mut offset)?;
        let root_public_key = read_key(data, &mut offset)?;
        let (root_sequence, n) = decode_varu64(&data[offset..])?;
        offset += n;
        let signature = read_signature(data, &mut offset)?;
        if offset != data.len() {
            return Err(WireError::InconsistentLength);
        }
        Ok(BootstrapAckPayload {
            path_id,
            sequence,
            destination_key,
            source_key,
            root_public_key,
            root_sequence,
            signature,
        })
    }
}

/// Parse a teardown payload: just the path identifier.
pub(crate) fn teardown_path_id(payload: &[u8]) -> Result<PathId, WireError> {
    if payload.len() != PATH_ID_SIZE {
        return Err(WireError::InconsistentLength);
    }
    let mut id = [0u8; PATH_ID_SIZE];
    id.copy_from_slice(payload);
    Ok(PathId(id))
}

fn read_path_id(data: &[u8], offset: &mut usize) -> Result<PathId, WireError> {
    if data.len() < *offset + PATH_ID_SIZE {
        return Err(WireError::Truncated);
    }
    let mut id = [0u8; PATH_ID_SIZE];
    id.copy_from_slice(&data[*offset..*offset + PATH_ID_SIZE]);
    *offset += PATH_ID_SIZE;
    Ok(PathId(id))
}

fn read_key(data: &[u8], offset: &mut usize) -> Result<PublicKey, WireError> {
    if data.len() < *offset + PUBLIC_KEY_SIZE {
        return Err(WireError::Truncated);
    }
    let mut key = [0u8; PUBLIC_KEY_SIZE];
    key.copy_from_slice(&data[*offset..*offset + PUBLIC_KEY_SIZE]);
    *offset += PUBLIC_KEY_SIZE;
    Ok(PublicKey(key))
}

fn read_signature(data: &[u8], offset: &mut usize) -> Result<[u8; SIGNATURE_SIZE], WireError> {
    if data.len() < *offset + SIGNATURE_SIZE {
        return Err(WireError::Truncated);
    }
    let mut sig = [0u8; SIGNATURE_SIZE];
    sig.copy_from_slice(&data[*offset..*offset + SIGNATURE_SIZE]);
    *offset += SIGNATURE_SIZE;
    Ok(sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH_TIMEOUT: Duration = Duration::from_secs(300);

    fn key(byte: u8) -> PublicKey {
        PublicKey([byte; 32])
    }

    fn entry(
        origin: PublicKey,
        target: PublicKey,
        source_port: Port,
        destination_port: Port,
        root: PublicKey,
        now: Instant,
    ) -> SnakeEntry {
        SnakeEntry {
            origin,
            target,
            source_port,
            destination_port,
            root_public_key: root,
            root_sequence: 0,
            last_seen: now,
        }
    }

    fn index(owner: PublicKey, id: u8) -> SnakeIndex {
        SnakeIndex {
            public_key: owner,
            path_id: PathId([id; 8]),
        }
    }

    #[test]
    fn install_is_idempotent() {
        let now = Instant::now();
        let mut snake = SnakeState::new(key(5), PATH_TIMEOUT);
        let idx = index(key(3), 1);
        let e = entry(key(3), key(5), 2, 0, key(9), now);
        assert!(snake.install(idx, e.clone()));
        assert!(!snake.install(idx, e));
        assert_eq!(snake.entries().count(), 1);
    }

    #[test]
    fn remove_clears_matching_slots() {
        let now = Instant::now();
        let mut snake = SnakeState::new(key(5), PATH_TIMEOUT);
        let idx = index(key(3), 1);
        snake.install(idx, entry(key(3), key(5), 2, 0, key(9), now));
        snake.set_descending(idx);
        assert!(snake.descending().is_some());
        assert!(snake.remove(&idx).is_some());
        assert!(snake.descending().is_none());
    }

    #[test]
    fn accepts_descending_between_current_and_us() {
        let now = Instant::now();
        let root = key(9);
        let mut snake = SnakeState::new(key(5), PATH_TIMEOUT);

        // Empty slot accepts anyone but us.
        assert!(snake.accepts_descending(&key(1), &root, now));
        assert!(!snake.accepts_descending(&key(5), &root, now));

        let idx = index(key(2), 1);
        snake.install(idx, entry(key(2), key(5), 3, 0, root, now));
        snake.set_descending(idx);

        // key(4) is between key(2) and key(5): closer predecessor.
        assert!(snake.accepts_descending(&key(4), &root, now));
        // key(1) is further away.
        assert!(!snake.accepts_descending(&key(1), &root, now));
        // The same neighbour refreshing is always welcome.
        assert!(snake.accepts_descending(&key(2), &root, now));
    }

    #[test]
    fn accepts_ascending_between_us_and_current() {
        let now = Instant::now();
        let root = key(9);
        let our = key(5);
        let mut snake = SnakeState::new(our, PATH_TIMEOUT);

        assert!(snake.accepts_ascending(&key(8), &root, now));

        let idx = index(our, 1);
        snake.install(idx, entry(our, key(8), 0, 4, root, now));
        snake.set_ascending(idx);

        assert!(snake.accepts_ascending(&key(6), &root, now));
        assert!(!snake.accepts_ascending(&key(9), &root, now));
        assert!(snake.accepts_ascending(&key(8), &root, now));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_slot_accepts_any_candidate() {
        let root = key(9);
        let mut snake = SnakeState::new(key(5), PATH_TIMEOUT);
        let idx = index(key(4), 1);
        snake.install(idx, entry(key(4), key(5), 3, 0, root, Instant::now()));
        snake.set_descending(idx);
        assert!(!snake.accepts_descending(&key(1), &root, Instant::now()));

        tokio::time::advance(PATH_TIMEOUT + Duration::from_secs(1)).await;
        // The slot's path expired, so even a worse candidate is accepted.
        assert!(snake.accepts_descending(&key(1), &root, Instant::now()));
        assert_eq!(snake.expired(Instant::now()), vec![idx]);
    }

    #[test]
    fn paths_via_port_finds_both_directions() {
        let now = Instant::now();
        let mut snake = SnakeState::new(key(5), PATH_TIMEOUT);
        snake.install(index(key(1), 1), entry(key(1), key(6), 2, 3, key(9), now));
        snake.install(index(key(2), 2), entry(key(2), key(7), 4, 1, key(9), now));
        let via_2 = snake.paths_via_port(2);
        assert_eq!(via_2, vec![index(key(1), 1)]);
        let via_1 = snake.paths_via_port(1);
        assert_eq!(via_1, vec![index(key(2), 2)]);
        assert!(snake.paths_via_port(9).is_empty());
    }

    #[test]
    fn stale_count_tracks_root_and_dupes() {
        let now = Instant::now();
        let root = key(9);
        let mut snake = SnakeState::new(key(5), PATH_TIMEOUT);
        snake.install(index(key(1), 1), entry(key(1), key(6), 2, 3, root, now));
        snake.install(index(key(1), 2), entry(key(1), key(6), 2, 3, root, now));
        snake.install(index(key(2), 3), entry(key(2), key(7), 4, 1, key(8), now));
        // Two dupes for key(1), one root mismatch for key(2).
        assert_eq!(snake.stale_count(&root, 0), 3);
    }

    #[test]
    fn next_hop_exact_delivery() {
        let now = Instant::now();
        let our = key(5);
        let snake = SnakeState::new(our, PATH_TIMEOUT);
        let view = TreeView {
            root_public_key: our,
            parent: None,
            ancestors: vec![],
            peers: vec![],
        };
        assert_eq!(snake.next_hop(&our, false, &view, now), 0);
    }

    #[test]
    fn next_hop_prefers_closest_above_destination() {
        let now = Instant::now();
        let our = key(5);
        let root = key(9);
        let mut snake = SnakeState::new(our, PATH_TIMEOUT);
        // A path owned by key(3) through port 2 and one owned by key(2)
        // through port 4.
        snake.install(index(key(3), 1), entry(key(3), our, 2, 0, root, now));
        snake.install(index(key(2), 2), entry(key(2), our, 4, 0, root, now));
        let view = TreeView {
            root_public_key: root,
            parent: Some(1),
            ancestors: vec![root],
            peers: vec![(1, root), (2, key(3)), (4, key(2))],
        };
        // Routing to key(2): key(3) is between the target and us, but the
        // exact owner key(2) wins outright.
        assert_eq!(snake.next_hop(&key(2), false, &view, now), 4);
        // Routing to key(1): closest above the target is key(2) on port 4.
        assert_eq!(snake.next_hop(&key(1), false, &view, now), 4);
        // Routing to key(4): nothing sits between it and us — we are its
        // successor, so it terminates here.
        assert_eq!(snake.next_hop(&key(4), false, &view, now), 0);
    }

    #[test]
    fn next_hop_climbs_toward_root_for_higher_keys() {
        let now = Instant::now();
        let our = key(5);
        let root = key(9);
        let snake = SnakeState::new(our, PATH_TIMEOUT);
        let view = TreeView {
            root_public_key: root,
            parent: Some(1),
            ancestors: vec![root],
            peers: vec![(1, root)],
        };
        // key(7) is between us and the root: climb.
        assert_eq!(snake.next_hop(&key(7), false, &view, now), 1);
        // The root itself.
        assert_eq!(snake.next_hop(&root, false, &view, now), 1);
    }

    #[test]
    fn bootstrap_never_terminates_at_sender() {
        let now = Instant::now();
        let our = key(5);
        let root = key(9);
        let snake = SnakeState::new(our, PATH_TIMEOUT);
        let view = TreeView {
            root_public_key: root,
            parent: Some(1),
            ancestors: vec![root],
            peers: vec![(1, root)],
        };
        // A bootstrap for our own key climbs instead of delivering locally.
        assert_eq!(snake.next_hop(&our, true, &view, now), 1);
        // Without a parent (we are root) it terminates with us.
        let lone = TreeView {
            root_public_key: our,
            parent: None,
            ancestors: vec![],
            peers: vec![],
        };
        assert_eq!(snake.next_hop(&our, true, &lone, now), 0);
    }

    #[test]
    fn bootstrap_for_highest_key_walks_the_wrap() {
        let now = Instant::now();
        // We are key(3); the root key(5) is bootstrapping towards itself.
        // Its successor is the lowest key in the network, so the bootstrap
        // walks downhill through the wrap instead of climbing.
        let our = key(3);
        let root = key(5);
        let snake = SnakeState::new(our, PATH_TIMEOUT);
        let view = TreeView {
            root_public_key: root,
            parent: Some(1),
            ancestors: vec![root],
            peers: vec![(1, root), (2, key(1))],
        };
        // The exact owner key(5) is a direct peer but a bootstrap must not
        // return to its sender; key(1) is the next stop around the circle.
        assert_eq!(snake.next_hop(&root, true, &view, now), 2);
        // An ordinary frame for the root just climbs.
        assert_eq!(snake.next_hop(&root, false, &view, now), 1);
    }

    #[test]
    fn bootstrap_payload_roundtrip() {
        let id = Identity::generate();
        let mut payload = BootstrapPayload {
            path_id: PathId([7; 8]),
            sequence: 42,
            root_public_key: key(9),
            root_sequence: 3,
            source_coords: Coordinates::new(vec![1, 2]),
            signature: [0; SIGNATURE_SIZE],
        };
        payload.sign(&id);
        assert!(payload.verify(&id.public_key));

        let bytes = payload.marshal();
        let decoded = BootstrapPayload::unmarshal(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert!(decoded.verify(&id.public_key));
        // Signature binds the destination key.
        assert!(!decoded.verify(&key(1)));
    }

    #[test]
    fn bootstrap_ack_payload_roundtrip() {
        let responder = Identity::generate();
        let mut payload = BootstrapAckPayload {
            path_id: PathId([7; 8]),
            sequence: 43,
            destination_key: key(2),
            source_key: responder.public_key,
            root_public_key: key(9),
            root_sequence: 3,
            signature: [0; SIGNATURE_SIZE],
        };
        payload.sign(&responder);
        let bytes = payload.marshal();
        let decoded = BootstrapAckPayload::unmarshal(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert!(decoded.verify());

        let mut tampered = decoded.clone();
        tampered.sequence += 1;
        assert!(!tampered.verify());
    }

    #[test]
    fn teardown_payload_parses() {
        assert_eq!(teardown_path_id(&[3; 8]).unwrap(), PathId([3; 8]));
        assert!(teardown_path_id(&[3; 7]).is_err());
        assert!(teardown_path_id(&[]).is_err());
    }
}
