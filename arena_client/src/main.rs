//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p arena_client -- [--addr 127.0.0.1:40000] [--ticks 600]
//!
//! A bot: connects, sends an echo test, streams a slowly orbiting player pose
//! with an occasional sweep, and logs what the server sends back.

use std::env;
use std::time::Duration;

use anyhow::Context;
use arena_client::client::{ClientState, GameClient};
use arena_shared::{
    config::ClientConfig,
    math::{Pose, Quat, Vec3},
    net::{NetTransform, NetVec3, TransformData},
};
use tracing::info;

/// Ticks between two sweep requests.
const SWEEP_EVERY: u32 = 120;

fn parse_args() -> (ClientConfig, u32) {
    let mut cfg = ClientConfig::default();
    let mut ticks = 600;
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--ticks" if i + 1 < args.len() => {
                ticks = args[i + 1].parse().unwrap_or(ticks);
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(cfg.tick_hz);
                i += 2;
            }
            _ => i += 1,
        }
    }
    (cfg, ticks)
}

fn orbit(angle: f32, radius: f32, height: f32) -> NetTransform {
    let position = Vec3::new(angle.cos() * radius, height, angle.sin() * radius);
    let orientation = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), -angle);
    Pose::new(position, orientation).into()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (cfg, ticks) = parse_args();
    info!(server = %cfg.server_addr, ticks, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    client.send_test(41).await?;
    client
        .send_transform(TransformData {
            id: client.slot,
            transform: orbit(0.0, 1.0, 1.0),
        })
        .await?;

    let tick_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.tick_hz.max(1)));
    for tick in 0..ticks {
        let angle = tick as f32 * 0.02;
        client
            .send_player_update(
                orbit(angle, 0.2, 1.7),
                orbit(angle + 0.4, 0.5, 1.2),
                orbit(angle - 0.4, 0.5, 1.2),
            )
            .await?;

        if tick % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let direction = NetVec3::new(-angle.sin(), 0.0, angle.cos());
            client
                .send_sweep(direction, NetVec3::new(0.0, 0.3, 0.0), 0.5, 0.0)
                .await?;
        }

        client.poll();
        if client.state == ClientState::Disconnected {
            break;
        }
        if tick % 60 == 0 {
            let world = &client.world;
            info!(
                tick,
                bodies = world.bodies.len(),
                players = world.players.len(),
                scores = ?world.scores,
                "Client view"
            );
        }
        tokio::time::sleep(tick_interval).await;
    }

    let world = &client.world;
    info!(
        slot = client.slot,
        test_replies = ?world.test_replies,
        echoes = world.echoes.len(),
        bodies = world.bodies.len(),
        players = world.players.len(),
        score_updates = world.score_updates,
        "Client finished"
    );
    Ok(())
}
