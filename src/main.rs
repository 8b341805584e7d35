//! pnio-cli: inspect configuration and exercise the engine locally.
//!
//! ## Subcommands
//!
//! - `pnio-cli config [show|validate] [--file PATH]` - effective configuration
//! - `pnio-cli selftest [COUNT]` - run loopback exchanges through a canned workflow
//! - `pnio-cli version`

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use pnio_core::config as pnio_config;
use pnio_core::network::{HttpExchange, LoopbackExchange, Outcome};
use pnio_core::telemetry::{self, LogConfig, MetricsStore};
use pnio_core::{Engine, EngineConfig, HandlerError, StatusCodeListener, Step, Workflow};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            let config = match load_config(&args) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to load configuration: {e}");
                    return ExitCode::from(2u8);
                }
            };
            match subcommand {
                "show" => print_json(&config.effective_config()),
                "validate" => match config.validate() {
                    Ok(()) => {
                        println!("configuration OK");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("invalid configuration: {e}");
                        ExitCode::from(2u8)
                    }
                },
                _ => {
                    eprintln!("Unknown config subcommand: {subcommand}");
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "selftest" => {
            let count = args.get(2).and_then(|s| s.parse::<usize>().ok()).unwrap_or(32);
            run_selftest(count)
        }
        "version" | "--version" | "-V" => {
            println!("pnio-cli {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {command}");
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Environment first, or the TOML file named by `--file`.
fn load_config(args: &[String]) -> Result<EngineConfig, pnio_core::ConfigError> {
    match args.iter().position(|a| a == "--file") {
        Some(i) => match args.get(i + 1) {
            Some(path) => EngineConfig::from_file(path),
            None => Err(pnio_core::ConfigError::Invalid {
                field: "--file",
                reason: "missing path".into(),
            }),
        },
        None => Ok(pnio_config::load()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render JSON: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Workflow state threaded through the self-test steps.
#[derive(Default)]
struct Scratch {
    parsed_len: usize,
    looked_up: bool,
}

fn selftest_workflow() -> Workflow<Scratch> {
    Workflow::builder(Step::compute("parse", |ex: &pnio_core::Exchange<Scratch>| {
        ex.workflow_state().parsed_len = ex.request().len();
        Ok(())
    }))
    .next(Step::blocking("lookup", |ex: &pnio_core::Exchange<Scratch>| {
        std::thread::sleep(Duration::from_millis(2));
        ex.workflow_state().looked_up = true;
        Ok(())
    }))
    .next(Step::future("enrich", |_ex: Arc<pnio_core::Exchange<Scratch>>| async {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok::<(), HandlerError>(())
    }))
    .next(Step::compute("render", |ex: &pnio_core::Exchange<Scratch>| {
        let body = {
            let state = ex.workflow_state();
            format!("{{\"len\":{},\"looked_up\":{}}}", state.parsed_len, state.looked_up)
        };
        ex.response().set_content_type("application/json");
        ex.write(body.as_bytes())
    }))
    .build()
}

fn run_selftest(count: usize) -> ExitCode {
    let mut log = LogConfig::from_env();
    if std::env::var_os("PNIO_LOG_LEVEL").is_none() {
        log.level = "warn".into();
    }
    if let Err(e) = telemetry::init_logging(&log) {
        eprintln!("logging disabled: {e}");
    }

    let config = EngineConfig {
        worker_threads: 2,
        blocking_pool_size: 2,
        ..pnio_config::load()
    };
    let store = Arc::new(MetricsStore::new());
    let engine = match Engine::with_metrics(
        config,
        selftest_workflow(),
        Arc::new(StatusCodeListener::default()),
        store.clone(),
    ) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to start engine: {e}");
            return ExitCode::FAILURE;
        }
    };

    let conns: Vec<Arc<LoopbackExchange>> = (0..count)
        .map(|i| Arc::new(LoopbackExchange::new(format!("/selftest/{i}"), vec![b'x'; i % 64])))
        .collect();
    for conn in &conns {
        let conn: Arc<dyn HttpExchange> = conn.clone();
        if let Err(e) = engine.accept(conn, Scratch::default(), false) {
            eprintln!("accept failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    let mut ok = 0usize;
    for conn in &conns {
        match conn.wait(Duration::from_secs(5)) {
            Some(Outcome::Sent(resp)) if resp.status == 200 => ok += 1,
            other => eprintln!("{}: unexpected outcome {other:?}", conn.uri()),
        }
    }

    engine.shutdown(Duration::from_secs(1));
    println!("{ok}/{count} exchanges succeeded");
    let code = print_json(&serde_json::json!({
        "stats": engine.stats(),
        "metrics": store.snapshot(),
    }));
    if ok == count {
        code
    } else {
        ExitCode::FAILURE
    }
}

fn print_usage() {
    eprintln!(
        "pnio-cli v{}

USAGE:
    pnio-cli [COMMAND] [OPTIONS]

COMMANDS:
    config show        Print the effective configuration as JSON
    config validate    Validate the configuration (exit 2 if invalid)
    selftest [COUNT]   Run loopback exchanges through a sample workflow
    version            Show version information
    help               Show this help message

OPTIONS:
    --file PATH        Read configuration from a TOML file instead of the environment

ENVIRONMENT:
    PNIO_*             Engine configuration (see `pnio-cli config show`)
    PNIO_LOG_LEVEL     Log filter for selftest (default: warn)
    PNIO_LOG_FORMAT    json or pretty
",
        env!("CARGO_PKG_VERSION")
    );
}
