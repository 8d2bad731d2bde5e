use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use spider_peer::cli::Cli;
use spider_peer::config::AppConfig;
use spider_peer::media::MediaPlan;
use spider_peer::session::{CloseReason, Session};
use spider_peer::signaling::websocket;
use spider_peer::telemetry::logging;
use spider_peer::transport::webrtc::RtcPeer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // .env is optional
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = AppConfig::from_cli(&cli).context("invalid configuration")?;
    logging::init(&config.logging).context("install logger")?;
    info!(mode = %config.mode, role = ?config.role, url = %config.url, "starting");

    if let MediaPlan::Receive(plan) = &config.media {
        if let Some(dir) = &plan.record_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create record directory {}", dir.display()))?;
        }
    }

    let (writer, reader) = websocket::connect(&config.connect_options())
        .await
        .context("connect to relay")?;
    let (peer, events) = RtcPeer::new(config.peer.clone(), config.media.clone())
        .await
        .context("create peer connection")?;

    let (session, handle) = Session::new(config.session.clone(), Arc::new(peer), events);

    let interrupt = tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.close(CloseReason::Interrupted);
            }
        }
    });

    let outcome = session.run(writer, reader).await;
    interrupt.abort();

    info!(
        reason = %outcome.reason,
        negotiated = outcome.reached_negotiated,
        applied_candidates = outcome.applied_candidates.len(),
        sent_candidates = outcome.sent_candidates,
        "session finished"
    );
    if outcome.reason.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(reason = %outcome.reason, "session ended with an error");
        Ok(ExitCode::FAILURE)
    }
}
