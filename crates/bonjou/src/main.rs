//! bonjou: chat and share files with peers on the local network.

use std::future::Future;
use std::io::{BufRead, Write as _};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use bonjou::{CommandDispatcher, Node, Outcome};
use bonjou_core::BonjouConfig;

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().skip(1).any(|a| a == "--version" || a == "-V") {
        println!("bonjou {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // stdout is the chat surface
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = BonjouConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BonjouConfig::default()
    });

    let (node, mut events) = match Node::start(config).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return Err(e).context("bonjou could not start");
        }
    };
    let node = Arc::new(node);
    let signal = shutdown_signal().context("failed to install signal handlers")?;
    tokio::pin!(signal);

    println!(
        "bonjou {} as {} ({}), listening on {}. @help for commands.",
        env!("CARGO_PKG_VERSION"),
        node.identity().display_name,
        node.id().short(),
        node.session_addr()
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{event}");
        }
    });

    let dispatcher = CommandDispatcher::new(node.clone());
    let mut lines = spawn_stdin_reader().context("failed to start stdin reader")?;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    None => {
                        tracing::info!("stdin closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "failed to read stdin");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match dispatcher.dispatch(&line).await {
                    Outcome::Reply(reply) => {
                        println!("{reply}");
                        let _ = std::io::stdout().flush();
                    }
                    Outcome::Exit => break,
                }
            }
            name = &mut signal => {
                tracing::info!(signal = name, "signal received, shutting down");
                break;
            }
        }
    }

    node.shutdown().await;
    drop(dispatcher);
    drop(node);
    // the printer drains whatever the shutdown reported
    let _ = tokio::time::timeout(std::time::Duration::from_millis(500), printer).await;
    println!("bye");
    Ok(())
}

/// Read stdin lines on a plain thread. A blocked read there never holds up
/// runtime shutdown; the thread dies with the process.
fn spawn_stdin_reader() -> std::io::Result<mpsc::Receiver<std::io::Result<String>>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    return;
                }
            }
        })?;
    Ok(rx)
}

/// Resolves on SIGINT or SIGTERM. Handlers are installed before this returns.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    })
}
