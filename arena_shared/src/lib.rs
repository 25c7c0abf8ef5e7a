//! `arena_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Fixed-layout wire messages with a single owner for the format.
//! - Application math types kept separate from the physics engine's.
//! - No `unsafe`.

pub mod config;
pub mod math;
pub mod net;
