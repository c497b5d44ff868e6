//! Neural Protocol wire layer: binary signal framing and transports.
//!
//! ## Architecture
//!
//! - **codec**: fixed 70-byte header plus JSON payload, and a streaming
//!   [`FrameDecoder`] for byte streams
//! - **control**: hub registration and peer-directory messages carried in
//!   frames with a reserved type tag
//! - **Transport**: async trait implemented by every backend
//! - **LocalTransport**: in-process per-identity FIFO queues
//! - **SocketTransport**: one outbound TCP/TLS connection with reconnect and
//!   jittered exponential backoff

pub mod backoff;
pub mod codec;
pub mod control;
pub mod local;
pub mod socket;
pub mod transport;

pub use codec::{
    decode, decode_frame, encode, encode_control, DecoderState, Frame, FrameDecoder, CONTROL_TAG,
    HEADER_LEN, PROTOCOL_VERSION,
};
pub use control::{ControlMessage, PeerDirectory};
pub use local::{LocalEndpoint, LocalStats, LocalTransport};
pub use socket::{Registration, SocketConfig, SocketStatus, SocketTransport};
pub use transport::{ConnectionState, Transport};
