//! The canonical conversation model everything else translates to and from.
//!
//! Several wire formats meet here:
//! - openai chat/responses messages and tools, inbound and outbound
//! - anthropic messages and content blocks, inbound and outbound
//! - gemini candidates and parts, outbound
//! - the coarse NDJSON shapes of local runtimes
//!
//! These overlap but never match, so adapters convert at the boundary and the
//! rest of the crate only ever sees these structs. The model is stateless and
//! per-request: callers resend prior history on every call.
pub mod completion;
pub mod content;
pub mod message;
pub mod tool;
