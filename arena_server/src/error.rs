//! Server error types.

use thiserror::Error;

/// Misuse of the simulation scene.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("player slot {slot} out of range (max {max})")]
    SlotOutOfRange { slot: usize, max: usize },
    #[error("scene used before init_scene")]
    NotInitialized,
    #[error("init_scene called twice")]
    AlreadyInitialized,
    #[error("scene used after cleanup")]
    CleanedUp,
}

/// Transport setup failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not start server at port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid listen address {0:?}")]
    Address(String),
}

/// Synchronization core failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not start server at port {port}")]
    Startup { port: u16 },
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: crate::server::ServerState,
    },
    #[error("could not spawn physics thread")]
    PhysicsThread(#[source] std::io::Error),
    #[error(transparent)]
    Config(#[from] arena_shared::config::ConfigError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
