//! Container CLI commands.

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::{LogControl, LogLine};
use crate::naming::{NameResolver, NamingContext};

pub async fn run_name_command(
    config: &Config,
    image: &str,
    pattern: Option<String>,
    alias: Option<String>,
    offline: bool,
) -> anyhow::Result<()> {
    let pattern = pattern.unwrap_or_else(|| config.naming.pattern.clone());
    let mut ctx = NamingContext::new(pattern, image);
    if let Some(alias) = alias {
        ctx = ctx.with_alias(alias);
    }
    if !offline {
        let client = super::connect(config).await?;
        ctx = ctx.with_existing(client.container_names().await?);
    }
    match NameResolver::new(config.naming.max_index).calculate_name(&ctx)? {
        Some(name) => println!("{}", name),
        None => println!("(chosen by the engine)"),
    }
    Ok(())
}

pub async fn run_logs_command(config: &Config, container: &str, follow: bool) -> anyhow::Result<()> {
    let client = super::connect(config).await?;
    if !follow {
        for line in client.logs(container).await? {
            print_line(&line);
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let handle = client
        .follow_logs_with_cancel(
            container,
            |line| {
                print_line(line);
                LogControl::Continue
            },
            cancel.clone(),
        )
        .await?;
    tokio::select! {
        outcome = handle.wait() => {
            tracing::debug!("Log stream ended: {:?}", outcome?);
        }
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
        }
    }
    Ok(())
}

fn print_line(line: &LogLine) {
    match line.timestamp {
        Some(ts) => println!("{} {}", ts.format("%H:%M:%S%.3f"), line.text),
        None => println!("{}", line.text),
    }
}
