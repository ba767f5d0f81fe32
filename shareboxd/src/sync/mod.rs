pub mod backoff;
pub mod conflict;
pub mod consistency;
pub mod directory;
pub mod error;
pub mod events;
pub mod groups;
pub mod orchestrator;
pub mod store;
mod store_impl;
pub mod trackers;
