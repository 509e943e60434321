/// mongo-session - client session manager for MongoDB deployments
///
/// Owns a pool of server connections, keeps a live view of the deployment
/// through background heartbeats, selects servers against a read preference,
/// dispatches commands with retry and failover rules, and exposes
/// server-side cursors as an explicit state machine.
///
/// Data flows caller -> [`dispatch::CommandDispatcher`] ->
/// [`topology::ServerSelector`] -> [`core::pool::ConnectionPool`] ->
/// codec and transport -> back to the caller as a reply, an error, or a
/// [`cursor::CursorSession`].
pub mod client;
pub mod config;
pub mod core;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod topology;
pub mod utils;

pub use client::{connect, Client, ClientBuilder, Collection, Database};
pub use config::{ClientOptions, Config, ConnectionString, WriteConcern};
pub use core::{Endpoint, Preference, ReadPreferenceMode, ServerRole, TagSet};
pub use cursor::{CursorSession, CursorState};
pub use dispatch::{CommandDispatcher, Operation, Reply};
pub use error::{CommandError, Error, NetworkError, NetworkErrorKind, Result};
pub use topology::{Topology, TopologyView};
