//! Engine stream decoding and the JSON-lines bridge to the overlay.
//!
//! Engine side: raw stdout chunks are reassembled into lines by
//! [`LineFramer`] and turned into [`EngineEvent`]s by [`decode_line`].
//!
//! Overlay side:
//! - Stdin reader thread: parses `{"cmd": "..."}` lines and forwards them
//! - Bridge loop: multiplexes commands, engine output and timers
//! - Writer thread: prints `{"event": "..."}` lines to stdout

mod decoder;
mod framer;
mod protocol;
mod router;
mod session;


pub use decoder::{clean_diagnostic, decode_line, DecodeError, EngineEvent};
pub use framer::LineFramer;
pub use protocol::{ClientCommand, OverlayEvent};
pub use router::{EventRouter, Routed, RouterStats};
pub use session::run_bridge;
