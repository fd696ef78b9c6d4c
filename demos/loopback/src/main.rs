//! Disengage and resume a pane against an in-process host.
//!
//! Run with: cargo run -p loopback-demo
//!
//! Reads `~/.config/remote-panes/config.toml` if present.

use std::sync::Arc;

use anyhow::Context;
use remote_panes_core::SessionConfig;
use remote_panes_session::{ChannelEvent, Gate, PaneSize, Session};
use remote_panes_transport::{HostOptions, LoopbackHost, MemoryTransportFactory};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = SessionConfig::load_or_default().context("loading config")?;
    let options = HostOptions {
        token: config.auth_token.clone(),
        layout: "{\"panes\":[]}".to_string(),
        control_label: config.control_label.clone(),
        ..HostOptions::default()
    };

    let (factory, remotes) = MemoryTransportFactory::new();
    let host = LoopbackHost::spawn(remotes, options);
    let gate = Gate::new(Session::builder(Arc::new(factory)).config(config).build());

    gate.connect().await?;
    let size = PaneSize { cols: 80, rows: 24 };
    let (pane, channel) = gate.open_pane("bash -l", Some(size)).await?;
    let mut events = channel.subscribe();

    channel.send("hello from the client\n")?;
    if let Some(ChannelEvent::Data(data)) = events.recv().await {
        println!("echo: {}", String::from_utf8_lossy(&data).trim_end());
    }

    let marker = gate.disengage().await?;
    println!("disengaged with marker {marker}");
    host.write(channel.id(), "output written while away\n");

    let resumption = gate.resume().await?;
    println!(
        "resumed ({}), layout {}",
        if resumption.is_restored() { "restored" } else { "fresh" },
        resumption.layout()
    );

    let channel = gate.pane(pane).await.context("pane was not reattached")?;
    let mut events = channel.subscribe();
    if let Some(ChannelEvent::Data(data)) = events.recv().await {
        println!("replayed: {}", String::from_utf8_lossy(&data).trim_end());
    }

    for info in gate.panes().await {
        println!(
            "pane {} -> channel {} `{}` {:?}",
            info.id, info.channel_id, info.command, info.ready_state
        );
    }

    gate.close();
    Ok(())
}
