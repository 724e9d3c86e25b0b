use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use color_eyre::Result;
use serde_json::json;
use wheelwright_core::{
    ArtifactStore, Builder, CommandStatus, Config, ExecutionOutcome, LocalDirStore, S3Store,
    StorageKey,
};

mod cli;

use cli::{BuildArgs, CommandCli, KeyArgs, WheelwrightCli};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = WheelwrightCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let outcome = match &cli.command {
        CommandCli::Build(args) => run_build(args),
        CommandCli::Key(args) => Ok(storage_key(args)),
    }
    .unwrap_or_else(|err| {
        ExecutionOutcome::failure(format!("{err:#}"), json!({ "kind": "setup_failed" }))
    });
    let code = emit_output(&cli, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("wheelwright={level},wheelwright_core={level},wheelwright_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run_build(args: &BuildArgs) -> anyhow::Result<ExecutionOutcome> {
    let config = Config::from_env().context("invalid configuration")?;
    let store: Arc<dyn ArtifactStore> = match &args.store_dir {
        Some(dir) => Arc::new(LocalDirStore::new(dir)),
        None => {
            let storage = config
                .require_storage()
                .context("S3 storage is not configured (or pass --store-dir)")?;
            Arc::new(S3Store::new(storage))
        }
    };
    let builder = Builder::new(&config, store)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(builder.install_package(
        &args.project,
        args.filename.clone(),
        &args.archive_url,
    ));

    Ok(match result {
        Ok(result) => ExecutionOutcome::from(&result),
        Err(failure) => ExecutionOutcome::from(&failure),
    })
}

fn storage_key(args: &KeyArgs) -> ExecutionOutcome {
    match StorageKey::new(&args.project, &args.filename) {
        Ok(key) => ExecutionOutcome::success(key.to_string(), json!({ "storage_key": key })),
        Err(err) => ExecutionOutcome::user_error(
            err.to_string(),
            json!({ "kind": "invalid_request", "error": err.to_string() }),
        ),
    }
}

fn emit_output(cli: &WheelwrightCli, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.status.exit_code();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else if matches!(outcome.status, CommandStatus::Ok) {
        if !cli.quiet {
            println!("{}", outcome.message);
        }
    } else {
        eprintln!("wheelwright: {}", outcome.message);
    }

    Ok(code)
}
