//! Wire protocol spoken between two taplink endpoints.
//!
//! Each direction of a connection is an independent sequence of
//! length-prefixed frames; see [`framing`].

pub mod framing;
