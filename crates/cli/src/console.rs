//! Console channel adapter — stdin in, stdout out.
//!
//! The daemon normally sits behind a messaging transport; for local runs and
//! development the console plays that role. Each stdin line is one inbound
//! message from the pseudo-peer `console`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use attache_config::AppConfig;
use attache_runtime::{ChannelAdapter, Core, InboundMessage};

struct ConsoleChannel {
    counter: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl ChannelAdapter for ConsoleChannel {
    async fn send(&self, text: &str, tag: Option<&str>) -> Result<String> {
        match tag {
            Some(tag) => println!("[{tag}] {text}"),
            None => println!("{text}"),
        }
        let n = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(format!("console-{n}"))
    }

    async fn send_file(&self, path: &Path) -> Result<()> {
        println!("[file] {}", path.display());
        Ok(())
    }
}

pub async fn run_daemon(config: AppConfig) -> Result<()> {
    let channel = Arc::new(ConsoleChannel { counter: std::sync::atomic::AtomicU64::new(0) });
    let core = Core::new(config, channel, None)?;
    let shutdown = core.shutdown_handle();

    // stdin → inbound messages.
    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if inbound_tx.send(InboundMessage::text("console", line)).await.is_err() {
                break;
            }
        }
    });

    // Ctrl-C begins the drain; a second signal force-exits after the grace
    // period so a supervisor can restart us.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                let _ = shutdown.send(true);
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                std::process::exit(1);
            }
        });
    }

    core.start(inbound_rx).await
}
