//! Spanning-tree maintenance: root election, parent selection and greedy
//! coordinate routing.
//!
//! Every node starts as the root of its own single-node tree. Announcements
//! carry a signed ancestor chain; a node adopts a peer's announcement as
//! its parent link when it names a strictly better root (greater key, or
//! same root with a newer sequence), or when the current parent has gone
//! quiet for too long. Coordinates fall out of the adopted chain: the
//! sequence of egress ports from the root down to us.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::crypto::Identity;
use crate::types::{Coordinates, Port, PublicKey, RootAnnouncement};

/// An announcement from a peer plus the local receive timestamp.
#[derive(Clone, Debug)]
pub(crate) struct AnnouncementEntry {
    pub announcement: RootAnnouncement,
    pub received_at: Instant,
}

/// Result of feeding a peer announcement into the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeUpdate {
    /// The root key changed; snake state must be rebuilt and everyone
    /// re-announced to.
    RootChanged,
    /// Same root but a newer sequence or changed chain; re-announce.
    Advanced,
    /// Stored for later candidate selection; no tree change.
    Stored,
    /// The chain contains our own key. Stored for routing (this is how a
    /// parent learns its children's coordinates) but never electable.
    Looped,
}

pub(crate) struct TreeState {
    our_key: PublicKey,
    /// Our root sequence, minted only while we are the root.
    self_sequence: u64,
    parent: Option<Port>,
    announcements: HashMap<Port, AnnouncementEntry>,
    announcement_timeout: Duration,
    parent_timeout: Duration,
}

impl TreeState {
    pub fn new(
        our_key: PublicKey,
        announcement_timeout: Duration,
        parent_timeout: Duration,
    ) -> Self {
        Self {
            our_key,
            self_sequence: 0,
            parent: None,
            announcements: HashMap::new(),
            announcement_timeout,
            parent_timeout,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent(&self) -> Option<Port> {
        self.parent
    }

    /// The announcement we currently believe in: our parent's, or our own
    /// self-announcement while we are the root.
    pub fn root_announcement(&self) -> RootAnnouncement {
        if let Some(entry) = self.parent.and_then(|p| self.announcements.get(&p)) {
            return entry.announcement.clone();
        }
        RootAnnouncement::for_root(self.our_key, self.self_sequence)
    }

    pub fn root_public_key(&self) -> PublicKey {
        self.parent
            .and_then(|p| self.announcements.get(&p))
            .map(|e| e.announcement.root_public_key)
            .unwrap_or(self.our_key)
    }

    pub fn root_sequence(&self) -> u64 {
        self.parent
            .and_then(|p| self.announcements.get(&p))
            .map(|e| e.announcement.root_sequence)
            .unwrap_or(self.self_sequence)
    }

    /// Our coordinates: the chain of egress ports in the parent's
    /// announcement, or `[]` at the root.
    pub fn coords(&self) -> Coordinates {
        self.parent
            .and_then(|p| self.announcements.get(&p))
            .map(|e| e.announcement.coords())
            .unwrap_or_default()
    }

    /// The announced public key of the peer on `port`, if it has ever sent
    /// a valid announcement.
    pub fn peer_key(&self, port: Port) -> Option<PublicKey> {
        self.announcements.get(&port).map(|e| e.announcement.announcer())
    }

    /// The root the peer on `port` last announced.
    pub fn peer_root(&self, port: Port) -> Option<PublicKey> {
        self.announcements
            .get(&port)
            .map(|e| e.announcement.root_public_key)
    }

    /// The ancestor chain of our current root announcement, root first.
    pub fn ancestors(&self) -> Vec<PublicKey> {
        let ann = self.root_announcement();
        let mut keys = vec![ann.root_public_key];
        keys.extend(
            ann.signatures
                .iter()
                .map(|s| s.public_key)
                .filter(|k| *k != ann.root_public_key && *k != self.our_key),
        );
        keys
    }

    /// A peer announced within the freshness window.
    pub fn seen_recently(&self, port: Port, now: Instant) -> bool {
        self.announcements
            .get(&port)
            .map(|e| now.duration_since(e.received_at) < self.announcement_timeout)
            .unwrap_or(false)
    }

    /// A peer announced recently *and* agrees with us on who the root is.
    pub fn seen_common_root_recently(&self, port: Port, now: Instant) -> bool {
        self.seen_recently(port, now)
            && self
                .announcements
                .get(&port)
                .map(|e| e.announcement.root_public_key == self.root_public_key())
                .unwrap_or(false)
    }

    /// Feed a verified peer announcement into the election.
    ///
    /// The caller is expected to have checked the signature chain already;
    /// loop rejection (our own key anywhere in the chain) happens here.
    pub fn update_announcement(
        &mut self,
        port: Port,
        announcement: RootAnnouncement,
        now: Instant,
    ) -> TreeUpdate {
        if announcement.contains(&self.our_key) {
            let old_root = self.root_public_key();
            let was_parent = self.parent == Some(port);
            self.announcements.insert(
                port,
                AnnouncementEntry {
                    announcement,
                    received_at: now,
                },
            );
            if was_parent {
                // Our parent now claims to sit below us; that cycle cannot
                // stand, so elect afresh.
                self.parent = None;
                self.reselect_parent(now);
                if self.root_public_key() != old_root {
                    return TreeUpdate::RootChanged;
                }
                return TreeUpdate::Advanced;
            }
            return TreeUpdate::Looped;
        }

        let old_root = self.root_public_key();
        let old_sequence = self.root_sequence();
        let old_coords = self.coords();

        self.announcements.insert(
            port,
            AnnouncementEntry {
                announcement: announcement.clone(),
                received_at: now,
            },
        );

        let adopted = if announcement.root_public_key > old_root {
            self.parent = Some(port);
            true
        } else if announcement.root_public_key == old_root
            && announcement.root_sequence > old_sequence
        {
            // First peer to bring a newer sequence wins the parent slot:
            // with unmeasured latency, earliest arrival is the tie-break.
            self.parent = Some(port);
            true
        } else if Some(port) == self.parent {
            if announcement.root_public_key < old_root
                || announcement.root_sequence < old_sequence
            {
                // Our parent lost its root; look for a better one.
                self.reselect_parent(now);
                true
            } else {
                // Same root and sequence from the parent; the chain may
                // still have changed shape.
                announcement.coords() != old_coords
            }
        } else {
            false
        };

        if !adopted {
            return TreeUpdate::Stored;
        }
        if self.root_public_key() != old_root {
            TreeUpdate::RootChanged
        } else {
            TreeUpdate::Advanced
        }
    }

    /// Whether the parent has gone quiet past the parent timeout.
    pub fn parent_timed_out(&self, now: Instant) -> bool {
        match self.parent.and_then(|p| self.announcements.get(&p)) {
            Some(entry) => now.duration_since(entry.received_at) >= self.parent_timeout,
            None => false,
        }
    }

    /// Re-run parent selection over every fresh stored announcement.
    /// Returns true if the root key changed as a result.
    pub fn reselect_parent(&mut self, now: Instant) -> bool {
        let old_root = self.root_public_key();
        let mut best: Option<(Port, PublicKey, u64)> = None;
        let mut ports: Vec<Port> = self.announcements.keys().copied().collect();
        ports.sort_unstable();
        for port in ports {
            let entry = &self.announcements[&port];
            if now.duration_since(entry.received_at) >= self.announcement_timeout {
                continue;
            }
            let ann = &entry.announcement;
            if ann.root_public_key <= self.our_key || ann.contains(&self.our_key) {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, key, seq)) => {
                    (ann.root_public_key, ann.root_sequence) > (*key, *seq)
                }
            };
            if better {
                best = Some((port, ann.root_public_key, ann.root_sequence));
            }
        }
        match best {
            Some((port, _, _)) => self.parent = Some(port),
            None => {
                // Nobody offers a better root than us; announce ourselves
                // with a fresh sequence.
                self.parent = None;
                self.self_sequence += 1;
            }
        }
        self.root_public_key() != old_root
    }

    /// Drop all state about a departed peer. Returns true if the root key
    /// changed (the peer was our parent and no equal replacement existed).
    pub fn remove_peer(&mut self, port: Port, now: Instant) -> bool {
        let old_root = self.root_public_key();
        self.announcements.remove(&port);
        if self.parent == Some(port) {
            self.parent = None;
            self.reselect_parent(now);
        }
        self.root_public_key() != old_root
    }

    /// Bump our root sequence ahead of a periodic self-announcement.
    /// Only meaningful while we are the root.
    pub fn advance_sequence(&mut self) {
        self.self_sequence += 1;
    }

    /// Build a freshly signed announcement to send out of `egress_port`.
    /// Returns `None` when our key is already in the chain (sending it
    /// would only be rejected as a loop at the far end).
    pub fn generate_announcement(
        &self,
        identity: &Identity,
        egress_port: Port,
    ) -> Option<RootAnnouncement> {
        let mut announcement = self.root_announcement();
        if announcement.signatures.iter().any(|s| s.public_key == self.our_key) {
            return None;
        }
        announcement.sign(identity, egress_port);
        Some(announcement)
    }

    /// Greedy next hop for a destination coordinate.
    ///
    /// Returns port 0 when the destination is exactly us, the strictly
    /// closest peer otherwise, or `None` when nobody improves on our own
    /// distance (the no-route case).
    pub fn next_hop(
        &self,
        destination: &Coordinates,
        now: Instant,
        peer_usable: impl Fn(Port) -> bool,
    ) -> Option<Port> {
        let our_coords = self.coords();
        if *destination == our_coords {
            return Some(0);
        }
        let mut best_distance = our_coords.distance_to(destination);
        let mut best: Option<Port> = None;
        let mut ports: Vec<Port> = self.announcements.keys().copied().collect();
        ports.sort_unstable();
        for port in ports {
            if !peer_usable(port) || !self.seen_common_root_recently(port, now) {
                continue;
            }
            let peer_coords = self.announcements[&port].announcement.peer_coords();
            let distance = peer_coords.distance_to(destination);
            if distance < best_distance {
                best_distance = distance;
                best = Some(port);
            }
        }
        best
    }
}
