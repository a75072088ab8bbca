//! beacon-discovery — peer discovery over repurposed DNS.
//!
//! A [`Discovery`] instance announces `topic → host:port` mappings to
//! configured tracker servers over unicast DNS and to the local link over
//! mDNS, looks the same mappings up again, and — once it binds listen
//! ports — serves as a tracker itself. Announcements are authenticated by
//! short-lived tokens binding each one to the source address the tracker
//! observed.

pub mod discovery;
pub mod store;

mod ingest;
mod mdns;
mod push;
mod responder;
mod tracker;
mod unicast;

pub use beacon_core::config::DiscoveryConfig;
pub use beacon_core::wire::{Peer, Topic};
pub use discovery::{Discovery, DiscoveryError, DiscoveryEvent, DEFAULT_SERVER_PORTS};
pub use store::PeerStore;
