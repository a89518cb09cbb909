//! # File Download Client Library
//!
//! Client-side counterpart of the file distribution server: connects over
//! UDP, requests files by category and selector, reassembles the chunked
//! stream and writes finished downloads to disk.
//!
//! The transport is unreliable, so the receiver in [`receiver`] accepts
//! only in-order chunks and acknowledges every accepted offset; stale
//! chunks trigger a re-ack and gaps are left for the server's rewind to
//! fill. The socket loop in [`network`] keeps the connection alive with
//! heartbeats while a download is in flight.

pub mod network;
pub mod receiver;
