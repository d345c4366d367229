mod cli;
mod report;

use crate::cli::{CliOpt, Command, RunOpt};
use anyhow::{Context, bail};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use testbed_core::config::EngineConfig;
use testbed_core::impairment::memory::MemoryDriver;
use testbed_core::instance::TopologyInstance;
use testbed_core::scheduler::TriggerOutcome;
use testbed_core::topology::compiler::{self, CompileError};
use testbed_core::topology::document::Document;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let options = CliOpt::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to initialize tokio")?;

    rt.block_on(run(options))
}

async fn run(options: CliOpt) -> anyhow::Result<()> {
    let config = match &options.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    let document = Document::from_path(&options.topology).with_context(|| {
        format!(
            "failed to load topology document at `{}`",
            options.topology.display()
        )
    })?;

    match &options.command {
        Command::Validate => validate(&options, document, &config),
        Command::Plan => plan(&options, document, &config).await,
        Command::Run(run_opt) => run_topology(&options, run_opt, document, &config).await,
    }
}

fn validate(options: &CliOpt, document: Document, config: &EngineConfig) -> anyhow::Result<()> {
    report::print_params(options, config);

    let loaded = compiler::load(document, &config.compiler_config());
    let validation = compiler::validate(&loaded.topology, Some(&loaded.scenarios));
    report::print_validation(&validation);

    if !validation.is_valid() {
        bail!("`{}` is invalid", options.topology.display());
    }

    Ok(())
}

async fn plan(options: &CliOpt, document: Document, config: &EngineConfig) -> anyhow::Result<()> {
    report::print_params(options, config);

    let instance = build(document, config).await?;
    report::print_topology(&instance);
    report::print_addresses(&instance);
    report::print_routes(&instance);
    report::print_resources(&instance);
    report::print_scenarios(&instance);

    instance.shutdown().await;
    Ok(())
}

async fn run_topology(
    options: &CliOpt,
    run_opt: &RunOpt,
    document: Document,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    report::print_params(options, config);

    let instance = build(document, config).await?;
    report::print_topology(&instance);
    instance.start();
    tracing::info!(
        "topology `{}` is up, {} scenarios registered",
        instance.topology().name,
        instance.scheduler().status().len()
    );

    println!("--- Run ---");
    for id in &run_opt.trigger {
        match instance.scheduler().trigger(id).await {
            Ok(TriggerOutcome::Activated(active)) => {
                let duration = active.end_time - active.start_time;
                println!("* Triggered {id} for {}s", duration.num_seconds());
            }
            Ok(TriggerOutcome::AlreadyActive) => println!("* {id} is already active"),
            Ok(TriggerOutcome::Failed) => println!("* {id} failed to start"),
            Ok(TriggerOutcome::Cancelled) => println!("* {id} was removed while starting"),
            Err(e) => println!("* Unable to trigger {id}: {e}"),
        }
    }

    if run_opt.for_secs > 0 {
        println!("* Running for {}s...", run_opt.for_secs);
        tokio::time::sleep(Duration::from_secs(run_opt.for_secs)).await;
    }

    report::print_scenarios(&instance);
    report::print_impairments(&instance);

    let events = instance.events().clone();
    instance.shutdown().await;

    report::print_events(&events);
    if let Some(path) = &run_opt.events {
        let json = serde_json::to_string_pretty(&events.snapshot())
            .context("failed to serialize the event log")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write event log to `{}`", path.display()))?;
        println!("* Event log available at {}", path.display());
    }

    Ok(())
}

/// Compiles the document and brings it up against an in-memory driver
async fn build(document: Document, config: &EngineConfig) -> anyhow::Result<TopologyInstance> {
    let compiled = match compiler::compile(document, &config.compiler_config()) {
        Ok(compiled) => compiled,
        Err(CompileError::Invalid(errors)) => {
            println!("--- Errors ---");
            for error in &errors {
                println!("* {error}");
            }
            bail!("the topology is invalid ({} errors)", errors.len());
        }
        Err(e) => return Err(e.into()),
    };

    let driver = Arc::new(MemoryDriver::new(&compiled.topology));
    let instance = TopologyInstance::from_compiled(compiled, driver, config)
        .await
        .context("failed to bring the topology up")?;

    Ok(instance)
}
