//! `aegis-cli` – Aegis command line shell.
//!
//! 1. Loads `~/.aegis/config.toml`, writing defaults on first run.
//! 2. Opens the SQLite store and restores the saved safety state.
//! 3. Drops the user into an interactive REPL that drives the controller
//!    with simulated device input.
//! 4. Stops evidence polling and the capability watcher on `/quit` or
//!    Ctrl-C.

mod config;
mod repl;

use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use aegis_middleware::EventBus;
use aegis_middleware::sim::{
    SimAudioCapture, SimAudioPlayer, SimCapabilityProvider, SimTranscriber, SimUploader,
};
use aegis_runtime::{SafetyController, SafetyServices};
use aegis_store::SqliteStore;
use aegis_types::{CapabilitySnapshot, SafetyState};
use aegis_voice::{EnrollmentServices, KeywordListener, VoiceEnrollment};

fn main() {
    // Installed before any runtime exists; see `init_tracing`.
    let _telemetry = aegis_runtime::init_tracing("aegis");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    // ── Store ─────────────────────────────────────────────────────────────
    if let Some(parent) = Path::new(&cfg.database_path).parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = config::ensure_private_dir(parent)
    {
        warn!(error = %e, "could not prepare database directory");
    }
    let store = match SqliteStore::open(&cfg.database_path, &cfg.user_id) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!(
                "{} {}: {}",
                "Failed to open database".red(),
                cfg.database_path.bold(),
                e
            );
            std::process::exit(1);
        }
    };

    // ── Controller ────────────────────────────────────────────────────────
    // Simulated device: microphone, location and storage granted.
    let provider = Arc::new(SimCapabilityProvider::new(CapabilitySnapshot::new(
        true, true, false, true, false,
    )));
    let controller = Arc::new(SafetyController::new(
        cfg.controller_config(),
        SafetyServices {
            persistence: store.clone(),
            capabilities: provider.clone(),
            evidence: store.clone(),
        },
    ));

    let restored = rt.block_on(async {
        let state = controller.initialize().await;
        controller.watch_capabilities();
        state
    });
    match restored {
        Ok(SafetyState::Disabled) => {}
        Ok(state) => println!(
            "  {} Restored safety state: {}",
            "!".yellow().bold(),
            state.as_str().bold()
        ),
        Err(e) => {
            eprintln!("{}: {}", "Failed to restore safety state".red(), e);
            std::process::exit(1);
        }
    }

    // ── Voice keyword ─────────────────────────────────────────────────────
    let transcriber = Arc::new(SimTranscriber::new(""));
    let enrollment = VoiceEnrollment::new(
        EnrollmentServices {
            capture: Arc::new(SimAudioCapture::new()),
            player: Arc::new(SimAudioPlayer::new()),
            transcriber: transcriber.clone(),
            uploader: Arc::new(SimUploader::new()),
            persistence: store.clone(),
        },
        EventBus::default(),
    );
    let listener = match store.latest_enrollment() {
        Ok(Some(record)) => {
            println!("  Voice keyword {} armed.", record.keyword.bold());
            KeywordListener::from_enrollment(&record)
        }
        Ok(None) => KeywordListener::new(),
        Err(e) => {
            warn!(error = %e, "could not load the enrolled keyword");
            KeywordListener::new()
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let controller = controller.clone();
        let handle = rt.handle().clone();
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – stopping monitoring …".yellow().bold());
            handle.block_on(controller.stop());
            shutdown.store(true, Ordering::SeqCst);
            println!("{}", "  ✓ Exiting Aegis.".green());
            std::process::exit(130);
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler");
        }
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let mut shell = repl::Shell {
        controller: controller.clone(),
        provider,
        transcriber,
        enrollment,
        listener,
    };
    repl::run(&mut shell, &rt, shutdown);

    rt.block_on(controller.stop());
    info!(state = %controller.state(), "aegis shell exited");
}

fn first_run() -> config::Config {
    let mut cfg = config::Config::default();
    config::apply_env_overrides(&mut cfg);
    println!("  No configuration found; writing defaults.");
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Config saved to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

fn print_banner() {
    println!();
    println!("{}", r#"    _             _     "#.bold().cyan());
    println!("{}", r#"   /_\  ___ __ _(_)___ "#.bold().cyan());
    println!("{}", r#"  / _ \/ -_) _` | (_-< "#.bold().cyan());
    println!("{}", r#" /_/ \_\___\__, |_/__/ "#.bold().cyan());
    println!("{}", r#"           |___/       "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Aegis".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Personal safety monitor");
    println!();
}
