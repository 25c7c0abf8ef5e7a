use std::time::Duration;

use arena_server::server::{bind_ephemeral, ServerState};
use arena_tests::{init_tracing, still_running};

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, cfg) = bind_ephemeral(64).await?;
    assert_ne!(cfg.server_addr, "127.0.0.1:0");

    server.start()?;
    for _ in 0..3 {
        assert!(still_running(&server.tick()?));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.ticks(), 3);
    assert_eq!(server.scene().lock().step_count(), 3);
    assert_eq!(
        server.scene().lock().actor_count(),
        cfg.physics.body_count as usize
    );

    server.shutdown();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!still_running(&server.tick()?));
    Ok(())
}

/// A second server on a taken port fails with the port in the error.
#[tokio::test]
async fn taken_port_is_reported() -> anyhow::Result<()> {
    init_tracing();
    let (_server, cfg) = bind_ephemeral(64).await?;
    let port = cfg.server_addr.rsplit(':').next().unwrap_or_default().to_string();

    let err = match arena_server::GameServer::bind(cfg).await {
        Ok(_) => panic!("port is already bound"),
        Err(e) => e,
    };
    assert!(err.to_string().contains(&port), "{err}");
    Ok(())
}
