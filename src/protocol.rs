//! Outbound wire-protocol emitters.
//!
//! Each emitter is a per-response state machine fed accumulated deltas and
//! writing protocol events through a caller-supplied sink, so HTTP framing
//! stays with the server layer.

pub mod anthropic;
pub mod chat;
pub mod gemini;
pub mod responses;
