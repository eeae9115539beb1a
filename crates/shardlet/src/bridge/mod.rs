//! Wire layer shared by the control protocol and the channel broker.
//!
//! # Architecture
//!
//! - **protocol**: the message tag catalog and envelope types
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
