//! Channel Relay: rule-based forwarding of channel posts with delivery tracking.

pub mod channels;
pub mod config;
pub mod error;
pub mod relay;
pub mod rules;
pub mod store;
pub mod tracker;
pub mod transform;
pub mod types;
