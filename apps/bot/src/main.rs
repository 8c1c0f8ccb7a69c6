use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use client_core::{
    load_settings, ClientConfig, ClientEvent, EventHandler, Invite, Message, ReadyContext,
    SyncClient,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Replies `pong` to `ping` and joins every room it is invited to.
#[derive(Parser, Debug)]
struct Args {
    /// TOML settings file. Defaults to `bot.toml` when it exists.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    homeserver: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    device_id: Option<String>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Register the account instead of logging in.
    #[arg(long)]
    register: bool,
}

impl Args {
    fn apply(&self, settings: &mut ClientConfig) {
        if let Some(v) = &self.homeserver {
            settings.homeserver = v.clone();
        }
        if let Some(v) = &self.username {
            settings.username = v.clone();
        }
        if let Some(v) = &self.device_id {
            settings.device_id = Some(v.clone());
        }
        if let Some(v) = self.poll_interval_ms {
            settings.poll_interval = Duration::from_millis(v);
        }
        if self.register {
            settings.register = true;
        }
    }
}

struct PingBot;

#[async_trait]
impl EventHandler for PingBot {
    async fn on_ready(&self, ctx: ReadyContext) -> Result<()> {
        info!(
            user_id = %ctx.user_id,
            device_id = %ctx.device_id,
            joined_rooms = ctx.joined_rooms,
            pending_invites = ctx.pending_invites,
            "bot ready"
        );
        Ok(())
    }

    async fn on_message(&self, message: Message) -> Result<()> {
        if message.is_own {
            return Ok(());
        }
        if message.body.trim().eq_ignore_ascii_case("ping") {
            message
                .reply("pong")
                .await
                .with_context(|| format!("failed to answer ping in {}", message.room_id))?;
        }
        Ok(())
    }

    async fn on_invite(&self, invite: Invite) -> Result<()> {
        info!(room_id = %invite.room_id, inviter = ?invite.inviter, "accepting invite");
        invite
            .accept(None)
            .await
            .with_context(|| format!("failed to join {}", invite.room_id))?;
        invite.send("Hello!").await.context("failed to greet room")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    args.apply(&mut settings);
    let client = SyncClient::from_config(&settings, Arc::new(PingBot))?;

    let stop = client.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            stop.stop();
        }
    });

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::StateChanged(state)) => debug!(%state, "client state"),
                Ok(event) => debug!(?event, "client event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "client events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client.run().await?;
    info!("bot stopped");
    Ok(())
}
