//! Presence discovery over UDP multicast.
//!
//! Peers announce themselves to a multicast group and withdraw on the
//! way out; a browse session keeps a registry of everyone currently
//! present and reports changes on the engine's event channel.

mod browser;
mod packet;

pub use browser::BrowseSession;
pub use packet::Announcement;
