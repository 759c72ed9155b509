//! DTLS-over-UDP demultiplexer and session manager.
//!
//! One bound UDP socket sustains many concurrent DTLS associations,
//! including constrained clients that roam across IP/port tuples using the
//! Connection ID extension (RFC 9146). Decrypted payloads are handed to an
//! application-supplied [`transport::RequestHandler`]; encrypted responses
//! flow back out through the same socket.
//!
//! The DTLS record and handshake machinery itself is external — see
//! [`provider`] for the seam, and [`insecure`] for the null-encryption
//! development implementation of it.

pub mod insecure;
pub mod provider;
pub mod queue;
pub mod session;
pub mod stats;
pub mod store;
pub mod transport;

pub use provider::{
    Accepted, AcceptError, ConnectionInfo, DatagramTransport, DtlsRecord, DtlsServerProtocol,
    RECEIVE_NO_DATA, RecordError, RecordFlags,
};
pub use session::{Session, SessionError, SessionState};
pub use store::{FindResult, SessionStore, StoreError};
pub use transport::{DtlsTransport, RequestContext, RequestHandler, TransportOptions};
