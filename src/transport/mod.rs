//! Bidirectional WebSocket transport (C4).

pub mod ws;
