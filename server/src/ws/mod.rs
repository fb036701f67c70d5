pub mod handler;
pub mod registry;
pub mod server;

/// Connection ID.
pub type ConnId = u64;

/// Message sent to a client.
pub type Msg = String;
