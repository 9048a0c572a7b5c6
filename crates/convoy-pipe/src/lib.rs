//! Topic-addressed duplex message pipe connecting the manager to its agents.
//!
//! The pipe is three queues: **requests** (manager → agents, topic-framed),
//! **responses** (agents → manager), and **operations** (control-plane key
//! administration). The manager core holds a [`Pipe`]; a transport drives
//! the matching [`PipeBackend`].
//!
//! Two transports are provided:
//!
//! - [`server::PipeServer`] / [`client::PipeClient`] — a TCP broker with
//!   length-delimited frames and curve-key admission, the deployment
//!   transport.
//! - [`memory::MemoryBroker`] — an in-process broker with the same lossy
//!   publish/subscribe semantics, for tests and single-process runs.
//!
//! The pub/sub contract is deliberately lossy: a frame published while no
//! matching subscriber is attached is gone. Senders that need delivery
//! confirm it out of band (the manager's announce/send/confirm loop).

pub mod auth;
pub mod client;
mod error;
pub mod framing;
pub mod memory;
mod pipe;
pub mod server;

pub use error::PipeError;
pub use memory::MemoryBroker;
pub use pipe::{pipe, AgentConn, AgentSender, Message, Operation, Pipe, PipeBackend, Subscription};
