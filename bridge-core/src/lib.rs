//! Bridge protocol reference implementation.
//! Sans-io: codecs and envelopes only; hosts own the sockets and threads.

pub mod envelope;
pub mod frame;
pub mod handshake;
pub mod http;

pub use envelope::{
    ColorSpec, FieldError, ImageSpec, IncomingMessage, Request, ResponseEnvelope, StatusReport,
};
pub use frame::{encode_frame, encode_masked_frame, read_frame, Frame, FrameError, Opcode};
pub use handshake::{accept_key, accept_response, HandshakeError};
pub use http::{HttpError, HttpRequest};

/// Default port the host binds and the client dials.
pub const DEFAULT_PORT: u16 = 8080;
