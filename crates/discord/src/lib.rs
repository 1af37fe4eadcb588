//! Discord session adapter.
//!
//! Maps a serenity gateway client onto the supervisor's session
//! capability interface. The supervisor never sees serenity types: events
//! arrive as [`courier_supervisor::SessionEvent`] values and messages as
//! gateway-agnostic [`courier_common::types::RelayMessage`]s.

mod connector;
mod handler;
mod history;

pub use connector::DiscordConnector;
