//! `gits-gateway`: HTTP front for the job scheduler.
//!
//! Exposes schedule / delete / status / jobs for clients, `/fire` for an
//! external trigger registry, and hosts the local trigger clock when enabled.

pub mod app;
pub mod http;
