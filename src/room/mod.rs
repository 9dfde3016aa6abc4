mod state;
mod streams;

pub use state::{Roster, RosterEntry};
pub use streams::{RemoteStream, RemoteStreamEntry, RemoteStreams, StreamMap};
