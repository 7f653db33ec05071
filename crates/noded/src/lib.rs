//! noded - nodemesh overlay node daemon

pub mod config;
