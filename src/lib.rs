//! emberfeed: heat-ranked content feed with read-through query caching and
//! live WebSocket fan-out.

pub mod application;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod reconcile;
pub mod util;
