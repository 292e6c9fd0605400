//! Stream one prompt through a remote agent and print the events.
//!
//! Run with: cargo run -p stream-client-example -- settings.toml "explain src/lib.rs" [context]
//!
//! `settings.toml` needs at least `server_url`; see `ClientSettings`.

use std::io::Write as _;

use anyhow::{Context as _, bail};
use remote_agents_core::{MessageRequest, SessionEvent};
use remote_agents_session::{ClientSettings, SessionClient};
use remote_agents_transport::WebSocketConnector;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(path), Some(prompt)) = (args.next(), args.next()) else {
        bail!("usage: stream-client <settings.toml> <prompt> [context]");
    };
    let context = match args.next() {
        Some(context) => context,
        None => std::env::current_dir()
            .context("Failed to read current directory")?
            .display()
            .to_string(),
    };

    let settings = ClientSettings::load(&path).with_context(|| format!("Loading {path}"))?;
    let client = SessionClient::from_settings(settings, WebSocketConnector::new());
    let mut events = client.subscribe();

    client.connect().await.context("Failed to connect")?;
    client.send_message(MessageRequest::new(prompt, context))?;

    let mut stdout = std::io::stdout();
    let mut printed = 0;
    while let Some(event) = events.recv().await {
        match event {
            // Snapshots grow; print only the new tail.
            SessionEvent::TextDelta(snapshot) => {
                if let Some(tail) = snapshot.get(printed..) {
                    write!(stdout, "{tail}")?;
                    stdout.flush()?;
                }
                printed = snapshot.len();
            }
            SessionEvent::TextCommitted(text) => {
                if let Some(tail) = text.get(printed..) {
                    writeln!(stdout, "{tail}")?;
                }
                printed = 0;
            }
            SessionEvent::ToolInvoked { name, args, .. } => println!("[tool] {name} {args}"),
            SessionEvent::ToolResult { text, is_error, .. } => {
                let label = if is_error { "tool error" } else { "tool result" };
                println!("[{label}] {text}");
            }
            SessionEvent::Thinking(text) => println!("[thinking] {text}"),
            SessionEvent::SessionCreated(id) => tracing::info!(%id, "Session created"),
            SessionEvent::Completed { session_id } => {
                tracing::info!(?session_id, "Done");
                break;
            }
            SessionEvent::Error { kind, message } if event_ends_run(kind) => {
                client.shutdown().await;
                bail!("{kind:?}: {message}");
            }
            SessionEvent::SendFailed { error, .. } => {
                client.shutdown().await;
                bail!("Send failed: {error}");
            }
            other => tracing::debug!(?other, "Event"),
        }
    }

    client.shutdown().await;
    Ok(())
}

const fn event_ends_run(kind: remote_agents_core::ErrorKind) -> bool {
    !matches!(kind, remote_agents_core::ErrorKind::Protocol)
}
