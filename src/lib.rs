//! RigelNet is a reliable, ordered, message-oriented transport on top of UDP.
//!
//! A [server::Server] owns one socket and a fixed number of [connector::Connector] slots, a
//!  [client::Client] owns one socket and one connector. Nodes are driven in cycles by the
//!  application: `update_receive` drains the socket and dispatches complete messages, and
//!  `update_send` (re-)transmits. Nothing blocks, and there are no background threads.
//!
//! ## Wire format
//!
//! All integers are big-endian. Every datagram starts with a `u32` [packet_kind::PacketKind]:
//!
//! * `HELLO` (passphrase) and `CONNECT` (passphrase, `i32` client index) make up the handshake
//! * `DATA`, `DATA_MORE` and `DATA_TAIL` carry a `u32` ordinal, a zero-terminated list of ordinals
//!    the sender acknowledges, and the payload. A message that does not fit into a single packet
//!    is sent as a run of `DATA_MORE` packets terminated by a `DATA_TAIL` packet.
//! * `ACKS` carries a zero-terminated list of weak acknowledgements, which stop re-transmission
//!    but do not retire a packet
//! * `DISCONNECT` carries an optional reason
//!
//! Strings are a `u32` byte length followed by UTF-8 bytes.
//!
//! Both sides of a connection can also live in the same process, in which case packets are
//!  exchanged through a [local_mailbox::LocalMailbox] rather than a socket.

pub mod client;
pub mod config;
pub mod connector;
pub mod event;
pub mod handler;
pub mod local_mailbox;
pub mod packet_kind;
pub mod packet_ordinal;
pub mod receive_buffer;
pub mod remote_info;
pub mod send_buffer;
pub mod server;
pub mod socket;
pub mod telemetry;
pub mod util;

#[cfg(test)]
mod test_util;
