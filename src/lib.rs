#![forbid(unsafe_code)]

// MeetRelay library - signaling relay for peer-to-peer video rooms

pub mod config;
pub mod ice;
pub mod metrics;
pub mod peer;
pub mod room;
pub mod signaling;
