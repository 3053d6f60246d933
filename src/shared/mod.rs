//! Transport plumbing shared by the handshake and the DAG invoker.
//!
//! - [`transport`] - [`Transport`] and [`Inbox`] traits, [`Endpoint`]
//! - [`tcp`] - Length-delimited TCP transport and pushed-frame listener
//! - [`req_channel`] - Single-flight request/reply discipline
//! - [`frame`] - Decoder for direct-response frames

pub mod frame;
pub mod req_channel;
pub mod tcp;
pub mod transport;

pub use frame::ResponseFrame;
pub use req_channel::{ChannelState, RequestChannel};
pub use tcp::{ResponseListener, TcpTransport};
pub use transport::{Endpoint, Inbox, Transport};
