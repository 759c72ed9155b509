//! Core types for talus — configuration and the stateless DTLS record
//! parser shared by the transport and the daemon.

pub mod config;
pub mod record;
