//! Stateless inspection of raw DTLS records.
//!
//! The demux loop has to classify every datagram before any session
//! context exists, so these helpers look only at fixed header offsets.
//! They never allocate and never fail — malformed input classifies as
//! "not a match".

/// DTLS content type for alert records (RFC 6347 §4.1).
pub const CONTENT_TYPE_ALERT: u8 = 21;
/// DTLS content type for handshake records.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;
/// DTLS content type for application data records.
pub const CONTENT_TYPE_APPLICATION_DATA: u8 = 23;
/// DTLS content type for records protected with a Connection ID
/// (RFC 9146 §4).
pub const CONTENT_TYPE_TLS12_CID: u8 = 25;

/// Handshake message type of a ClientHello.
pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// The plaintext DTLS record header: content type, version, epoch and
/// 48-bit sequence number, then the 16-bit length.
pub const RECORD_HEADER_LEN: usize = 13;

/// Offset of the handshake message type: the record header, then the
/// first byte of the handshake message header.
const HANDSHAKE_TYPE_OFFSET: usize = RECORD_HEADER_LEN;

/// Smallest record that can carry a ClientHello: record header plus the
/// 12-byte handshake message header.
const MIN_CLIENT_HELLO_LEN: usize = 25;

/// Offset of the connection ID in a tls12_cid record: content type,
/// version, epoch and sequence number — the length field moves after the
/// CID (RFC 9146 §4).
const CID_OFFSET: usize = 11;

/// Whether a datagram could open a new handshake.
///
/// Checks only the content type and the handshake message type; the DTLS
/// layer does the real parsing once a session exists.
pub fn may_be_client_hello(datagram: &[u8]) -> bool {
    datagram.len() >= MIN_CLIENT_HELLO_LEN
        && datagram[0] == CONTENT_TYPE_HANDSHAKE
        && datagram[HANDSHAKE_TYPE_OFFSET] == HANDSHAKE_CLIENT_HELLO
}

/// Extract the connection ID from a tls12_cid record.
///
/// CIDs are opaque and carry no length on the wire, so the caller must
/// supply the process-wide negotiated length.
pub fn try_get_connection_id(datagram: &[u8], cid_len: usize) -> Option<&[u8]> {
    if datagram.len() >= CID_OFFSET + cid_len && datagram[0] == CONTENT_TYPE_TLS12_CID {
        Some(&datagram[CID_OFFSET..CID_OFFSET + cid_len])
    } else {
        None
    }
}
