//! `agora-cli` – Agora kernel launcher
//!
//! Boots one kernel on a process-local cluster:
//!
//! 1. Loads `~/.agora/kernel.toml`, writing the defaults on first run.
//! 2. Starts the kernel services in priority order and binds the transport.
//! 3. Waits for **Ctrl-C**, then stops the services in reverse order.
//!
//! A boot failure exits with status 1.

use std::process::ExitCode;
use std::sync::Arc;

use agora_middleware::{InMemoryCluster, LoopbackNetwork};
use agora_runtime::config::{self, KernelConfig};
use agora_runtime::{Kernel, init_tracing};
use colored::Colorize;
use tokio::sync::Notify;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let _telemetry = init_tracing("agora");
    print_banner();

    let cfg = load_config();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("agora-kernel")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build the Tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cfg))
}

async fn run(cfg: KernelConfig) -> ExitCode {
    let cluster = InMemoryCluster::new();
    let hub = LoopbackNetwork::new();

    let kernel = match Kernel::in_memory(cfg, &cluster, &hub) {
        Ok(kernel) => kernel,
        Err(e) => {
            error!(error = %e, "kernel assembly failed");
            println!("{}: {}", "Boot failed".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    let uri = match kernel.start().await {
        Ok(uri) => uri,
        Err(e) => {
            error!(error = %e, "kernel start failed");
            println!("{}: {}", "Boot failed".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    println!("  {} Kernel running at {}", "✓".green().bold(), uri.to_string().bold());
    println!("    member       {}", kernel.member().to_string().dimmed());
    println!("    root context {}", kernel.config().root_context_id.to_string().dimmed());
    println!("    registry     {}", kernel.config().registry.to_string().dimmed());
    println!();
    println!("  Press {} to shut down.\n", "Ctrl-C".bold().cyan());

    wait_for_shutdown().await;

    println!();
    println!("{}", "⚠  Ctrl-C received – stopping kernel …".yellow().bold());
    match kernel.stop().await {
        Ok(()) => {
            println!("{}", "  ✓ Kernel stopped.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "kernel stop reported a failure");
            println!("{}: {}", "Shutdown incomplete".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_shutdown() {
    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    match ctrlc::set_handler(move || signal.notify_one()) {
        Ok(()) => shutdown.notified().await,
        Err(e) => {
            warn!(error = %e, "Failed to install Ctrl-C handler; falling back to the Tokio signal listener");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "no shutdown signal available; stopping now");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

fn load_config() -> KernelConfig {
    let path = config::config_path();
    if path.exists() {
        println!("  Config loaded from {}", path.display().to_string().bold());
    } else {
        match config::save(&KernelConfig::default()) {
            Ok(()) => println!(
                "  {} Default config written to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            ),
            Err(e) => warn!(error = %e, "could not write the default config"),
        }
    }

    let cfg = match config::resolve() {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = KernelConfig::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    info!(cluster = %cfg.cluster_id, uri = %cfg.kernel_uri, "configuration resolved");
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___ ____ ____  _______ _"#.bold().cyan());
    println!("{}", r#"  / _ `/ _ `/ _ \/ __/ _ `/"#.bold().cyan());
    println!("{}", r#"  \_,_/\_, /\___/_/  \_,_/ "#.bold().cyan());
    println!("{}", r#"      /___/                "#.bold().cyan());
    println!();
    println!("  {} {}", "Agora".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Distributed multi-agent kernel");
    println!();
}
