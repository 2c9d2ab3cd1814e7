//! GhostStream delivery server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry points are main.rs and bin/ingest.rs.

pub mod assets;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod presign;
pub mod ratelimit;
pub mod routes;
pub mod state;
