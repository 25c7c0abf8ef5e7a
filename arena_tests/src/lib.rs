//! Shared helpers for the socket integration tests.

use std::time::Duration;

use anyhow::Context;
use arena_server::{
    scene::SharedScene,
    server::{StopHandle, TickOutcome},
    GameServer, ServerError,
};
use arena_shared::config::{ClientConfig, ServerConfig};
use tokio::task::JoinHandle;
use tracing::info;

/// Installs a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A socket server ticking on a background task.
pub struct RunningServer {
    pub cfg: ServerConfig,
    pub scene: SharedScene,
    stop: StopHandle,
    task: JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    /// Binds `cfg` on an ephemeral localhost port and runs it.
    pub async fn spawn(mut cfg: ServerConfig) -> anyhow::Result<Self> {
        cfg.server_addr = "127.0.0.1:0".to_string();
        let mut server = GameServer::bind(cfg.clone()).await.context("bind server")?;
        cfg.server_addr = server
            .local_addr()
            .context("socket transport has an address")?
            .to_string();
        let scene = server.scene().clone();
        let stop = server.stop_handle();
        info!(addr = %cfg.server_addr, "Test server up");

        let task = tokio::spawn(async move { server.run().await });
        Ok(Self {
            cfg,
            scene,
            stop,
            task,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_addr: self.cfg.server_addr.clone(),
            tick_hz: self.cfg.tick_hz,
        }
    }

    /// Requests a cooperative stop and waits for the loop to finish.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.stop.stop();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .context("server did not stop in time")?
            .context("server task panicked")?
            .context("server loop failed")?;
        Ok(())
    }
}

/// True when the outcome means the server is still serving.
pub fn still_running(outcome: &TickOutcome) -> bool {
    matches!(outcome, TickOutcome::Ran { .. })
}
