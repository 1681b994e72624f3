//! Demo binary: two endpoints on one in-process relay place a short
//! audio call against the real WebRTC stack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use ringline::calling::{CallKind, CallManager, CallUpdate, SignalingRelay, WebRtcFactory};
use ringline::config::CallConfig;
use ringline::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = CallConfig::default();
    let relay = SignalingRelay::new(config.clone());
    let factory = Arc::new(WebRtcFactory::new(config.clone()));

    let (alice, mut alice_updates) =
        CallManager::new("alice", &relay, factory.clone(), config.clone()).await;
    let (bob, mut bob_updates) = CallManager::new("bob", &relay, factory, config).await;

    let room = alice.initiate_call("bob", CallKind::Audio).await?;
    tracing::info!(%room, "alice is calling bob");

    let bob_task = tokio::spawn(async move {
        while let Some(update) = bob_updates.recv().await {
            match update {
                CallUpdate::IncomingCall { caller, kind, .. } => {
                    tracing::info!(%caller, %kind, "bob: incoming call, accepting");
                    if let Err(e) = bob.accept_incoming().await {
                        tracing::error!("bob: accept failed: {e}");
                    }
                }
                CallUpdate::StateChanged { state, .. } => {
                    tracing::info!(?state, "bob: call state");
                }
                CallUpdate::RemoteTrack { track, .. } => {
                    tracing::info!(id = %track.id, "bob: remote track");
                }
                CallUpdate::Ended { reason, .. } => {
                    tracing::info!(?reason, "bob: call ended");
                    break;
                }
            }
        }
    });

    let hangup = alice.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        hangup.hang_up().await;
    });

    while let Some(update) = alice_updates.recv().await {
        match update {
            CallUpdate::StateChanged { state, .. } => {
                tracing::info!(?state, "alice: call state");
            }
            CallUpdate::RemoteTrack { track, .. } => {
                tracing::info!(id = %track.id, "alice: remote track");
            }
            CallUpdate::Ended { reason, .. } => {
                tracing::info!(?reason, "alice: call ended");
                break;
            }
            CallUpdate::IncomingCall { .. } => {}
        }
    }

    bob_task.await?;
    Ok(())
}
