//! Wire types shared across the hub protocol stack.
//!
//! This crate provides:
//! - The fixed 24-byte frame header codec ([`header`])
//! - The authentication sub-protocol envelope and payload types ([`auth`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod header;

pub use header::{encode, read_frame, Header, Major, WireError, HEADER_LEN, MAX_PAYLOAD, SUB_PROTO_AUTH};
