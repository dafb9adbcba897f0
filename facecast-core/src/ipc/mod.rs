//! Serialisable events for hosts that forward engine output (WebSocket,
//! IPC bus, log file).

pub mod events;
