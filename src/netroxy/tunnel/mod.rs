//! Reverse TCP tunnel.
//!
//! A client keeps one control connection to the server and asks it to open
//! public ports (MAP). Every public connection is announced to the client
//! (TRQ), which dials back a data connection (TRS) that the server splices
//! with the public one.

pub mod broker;
pub mod client;
pub mod dashboard;
pub mod mapping;
pub mod protocol;
pub mod server;
pub mod session;
pub mod splice;
pub mod supervisor;
pub mod transport;
