//! pinecone — an overlay router over arbitrary duplex transports.
//!
//! Peers form a spanning tree rooted at the greatest public key and, on
//! top of it, a "virtual snake": a line through keyspace in which every
//! node holds a path to its keyspace predecessor and successor. Traffic
//! routes greedily either by tree coordinates or by public key.
//!
//! # Architecture
//!
//! - **types**: keys, coordinates, varints, watermarks, signed announcements
//! - **crypto**: Ed25519 node identity
//! - **wire**: bit-exact frame codec
//! - **queues**: bounded proto FIFO, traffic LIFO, marshal buffer pool
//! - **peer**: per-connection reader/writer/announcer tasks
//! - **tree**: root election, parent selection, coordinate routing
//! - **snake**: keyspace paths, bootstrap protocol, teardown
//! - **router**: the single-actor shell tying it all together
//!
//! # Example
//!
//! ```no_run
//! use pinecone::{ConnectOptions, Identity, Router};
//!
//! # async fn run() -> Result<(), pinecone::RouterError> {
//! let mut router = Router::new(Identity::generate());
//! let stream = tokio::net::TcpStream::connect("peer:4000").await?;
//! router.connect(stream, ConnectOptions::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
mod peer;
mod queues;
pub mod router;
mod snake;
mod tree;
pub mod types;
pub mod wire;

// Re-export the primary surface at the crate root.
pub use crypto::Identity;
pub use error::{RouterError, WireError};
pub use peer::PeerStatistics;
pub use router::{
    ConnectOptions, DhtInfo, PeerInfo, Router, RouterBuilder, RouterConfig, RouterObserver,
    SnakeNeighbour, SnakePathInfo, PORT_COUNT,
};
pub use types::{Coordinates, PathId, Port, PublicKey, RootAnnouncement, Watermark};
pub use wire::{Frame, FrameType, MAX_FRAME_SIZE};
