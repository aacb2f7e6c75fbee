use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::error::Error;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use intercom_harness::capture::CaptureService;
use intercom_harness::config::{self, Config};
use intercom_harness::runner::{RunMode, Runner, latest_artifact, parse_run_log};
use intercom_harness::server;

/// Intercom harness - acceptance and regression runs against intercom devices
#[derive(Parser, Debug)]
#[command(
    name = "intercom-harness",
    about = "Parallel device test runs with syslog capture and log-confirmed door actuation",
    after_help = "ENVIRONMENT VARIABLES:\n\
        INTERCOM_HARNESS_CAPTURE_PORT      Capture UDP port\n\
        INTERCOM_HARNESS_CAPTURE_DIR       Directory for per-device log streams\n\
        INTERCOM_HARNESS_DEVICE_CONFIG     Device config file\n\
        INTERCOM_HARNESS_LOG_DIR           Run log directory\n\
        INTERCOM_HARNESS_MQTT_HOST         Broker for relay/key channels\n\
        INTERCOM_HARNESS_MAX_PARALLEL      Concurrent device workers (0 = one per device)\n\
        RUST_LOG                           Log filter (default intercom_harness=info)"
)]
struct Args {
    /// Device config file
    #[arg(long, short = 'c', global = true, env = "INTERCOM_HARNESS_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    /// Capture UDP port
    #[arg(long, global = true, env = "INTERCOM_HARNESS_CAPTURE_PORT")]
    capture_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run tests against every configured device and print the run log
    Run {
        /// acceptance, regression or selected
        mode: String,

        /// Tests for `selected` mode, comma-separated (e.g. "reset,send_text")
        #[arg(short, long, value_delimiter = ',')]
        tests: Vec<String>,
    },

    /// Run the capture service until Ctrl-C
    Capture,

    /// Print the captured log lines of one device
    Logs {
        /// Device host (IP)
        host: String,

        /// Keep printing new lines as they arrive, until Ctrl-C
        #[arg(short, long)]
        follow: bool,
    },

    /// List registered tests in full-suite order
    Tests,

    /// Serve the HTTP run-control surface
    Serve {
        /// Bind address
        #[arg(long, env = "INTERCOM_HARNESS_HTTP_BIND")]
        bind: Option<String>,
    },

    /// Summarize a run log (latest in the log directory by default)
    Report {
        path: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("intercom_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut cfg: Config = config::get().clone();
    if let Some(path) = args.config {
        cfg.runner.device_config = path;
    }
    if let Some(port) = args.capture_port {
        cfg.capture.port = port;
    }

    match args.command {
        Some(Commands::Run { mode, tests }) => {
            let mode = RunMode::from_name(&mode, tests)?;
            let runner = Runner::new(&cfg);
            runner.start(mode).await?;

            let mut events = Box::pin(runner.events());
            let mut last = None;
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(status) => {
                            if !status.done {
                                eprint!("\rprogress: {:>3}%", status.progress);
                            }
                            last = Some(status);
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\nstopping after in-flight devices finish...");
                        last = runner.stop().await;
                        break;
                    }
                }
            }
            eprintln!();

            if let Some(status) = last {
                if let Some(artifact) = &status.artifact {
                    eprintln!("run log: {}", artifact.display());
                }
                println!("{}", status.result.unwrap_or_default());
            }
        }

        Some(Commands::Capture) => {
            let capture = CaptureService::new(&cfg.capture);
            let addr = capture.start().await?;
            eprintln!(
                "capturing on udp://{} into {}",
                addr,
                capture.log_dir().display()
            );
            tokio::signal::ctrl_c().await?;
            capture.stop().await;
        }

        Some(Commands::Logs { host, follow: false }) => {
            let capture = CaptureService::new(&cfg.capture);
            for record in capture.read(&host, "cli", false).await? {
                println!("{}", record.line);
            }
        }

        Some(Commands::Logs { host, follow: true }) => {
            let capture = CaptureService::new(&cfg.capture);
            let mut tail = Box::pin(capture.tail(&host, "cli", cfg.confirm.poll_interval));
            loop {
                tokio::select! {
                    batch = tail.next() => match batch {
                        Some(batch) => {
                            for record in batch? {
                                println!("{}", record.line);
                            }
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }

        Some(Commands::Tests) => {
            for name in intercom_harness::suite::list_tests() {
                println!("{}", name);
            }
        }

        Some(Commands::Serve { bind }) => {
            let bind = bind.unwrap_or_else(|| cfg.runner.http_bind.clone());
            server::serve(Runner::new(&cfg), &bind).await?;
        }

        Some(Commands::Report { path, json }) => {
            let path = match path {
                Some(path) => path,
                None => latest_artifact(&cfg.runner.log_dir)?
                    .ok_or_else(|| format!("no run logs in {}", cfg.runner.log_dir.display()))?,
            };
            let log = parse_run_log(&std::fs::read_to_string(&path)?);
            let summary = log.summary();

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "path": path,
                        "summary": summary,
                        "warnings": log.warnings,
                        "devices": log.blocks,
                    }))?
                );
            } else {
                println!("{}", path.display());
                println!(
                    "  devices: {}  passed: {}  failed: {}",
                    summary.devices, summary.passed, summary.failed
                );
                for warning in &log.warnings {
                    println!("  {}", warning);
                }
                for block in &log.blocks {
                    let address = block.params.get("IP_CAMERA").map(String::as_str).unwrap_or("?");
                    let screenshot = block.outcomes.get("screenshot").map(String::as_str).unwrap_or("-");
                    println!("  {:<24} screenshot: {}", address, screenshot);
                }
            }
        }

        None => {
            println!("Intercom harness - device test runs with log-confirmed actuation");
            println!();
            println!("Usage: intercom-harness <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run      Run acceptance, regression or selected tests");
            println!("  capture  Run the syslog capture service");
            println!("  logs     Print captured log lines for a device");
            println!("  tests    List registered tests");
            println!("  serve    Serve the HTTP run-control surface");
            println!("  report   Summarize a run log");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}
