//! Run plan CLI commands.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::order::{Dependent, StartOrderResolver};
use crate::runner::{RunPlan, Runner, StartedContainer};

pub fn run_order_command(plan: &Path, existing: Vec<String>) -> anyhow::Result<()> {
    let plan = RunPlan::load(plan)?;
    let ordered = StartOrderResolver::new()
        .with_existing(existing)
        .order(plan.containers)?;
    for (i, spec) in ordered.iter().enumerate() {
        let deps = spec.dependencies();
        if deps.is_empty() {
            println!("{:>3}. {} ({})", i + 1, spec.name, spec.image);
        } else {
            println!(
                "{:>3}. {} ({}) after {}",
                i + 1,
                spec.name,
                spec.image,
                deps.join(", ")
            );
        }
    }
    Ok(())
}

pub async fn run_up_command(config: &Config, plan_path: &Path, keep: bool) -> anyhow::Result<()> {
    let plan = RunPlan::load(plan_path)?;
    let client = super::connect(config).await?;
    let keep = keep || plan.keep_containers;
    let runner = Runner::new(client, config.clone()).with_keep_containers(keep);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping");
            on_signal.cancel();
        }
    });

    let started = match runner
        .start_all(plan.containers, &plan.variables, cancel.clone())
        .await
    {
        Ok(started) => started,
        Err(e) => {
            runner.stop_all().await;
            return Err(e.into());
        }
    };

    print_started(&started);
    if let Some(path) = &plan.port_properties {
        runner.port_table().write_properties(path)?;
        println!("Wrote port variables to {}", path.display());
    }

    if keep {
        return Ok(());
    }
    println!("Press Ctrl-C to stop");
    cancel.cancelled().await;
    let removed = runner.stop_all().await;
    println!("Removed {} container(s)", removed);
    Ok(())
}

fn print_started(started: &[StartedContainer]) {
    for container in started {
        let name = container
            .container_name
            .as_deref()
            .unwrap_or(container.short_id());
        println!("{} {} ({})", container.short_id(), name, container.image);
        for port in &container.ports {
            println!(
                "    {} -> {}:{}",
                port.container, port.host_ip, port.host_port
            );
        }
    }
}
