pub mod configuration;
pub use configuration::Config;

pub mod connection;
pub use connection::{ConnectionClosure, ConnectionState};

pub mod error_handling;

pub mod eventlog;
pub use eventlog::{EventLog, LoggedEvent};

pub mod iolog;
pub use iolog::{IoLogSession, IoLogStore};

pub mod protocol;

pub mod relay;
pub use relay::RelayLink;

pub mod server;
pub use server::Server;
