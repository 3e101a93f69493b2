//! credmon command-line front end.
//!
//! Opens the registry from `CREDMON_*` environment variables (optionally
//! loaded from a `.env` file) and runs one subcommand against it.

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use credmon::{EngineConfig, MonitorId, MonitorResult, NewMonitor, Registry, SourceKind};

/// Parsed command line.
enum Command {
    Watch {
        name: Option<String>,
        sources: Vec<SourceKind>,
        domains: Vec<String>,
        run_for: Option<Duration>,
    },
    Extract,
    Status,
    Reload,
    Clear {
        monitor: Option<MonitorId>,
    },
}

fn usage() {
    println!("credmon - credential capture monitor");
    println!();
    println!("USAGE:");
    println!("    credmon <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    watch     Create a monitor and print records as they are captured");
    println!("    extract   Scan both sources once and print what was found");
    println!("    status    Print every monitor's status");
    println!("    reload    Merge everything currently in the sources into the default monitor");
    println!("    clear     Clear stored records");
    println!();
    println!("WATCH OPTIONS:");
    println!("    --name <NAME>         Monitor display name");
    println!("    --source <log|site>   Enable a source (repeatable) [default: both]");
    println!("    --domain <DOMAIN>     Only admit records for this domain (repeatable)");
    println!("    --for <SECS>          Stop after SECS seconds [default: run until interrupted]");
    println!();
    println!("CLEAR OPTIONS:");
    println!("    --monitor <ID>        Only clear this monitor [default: all]");
    println!();
    println!("ENVIRONMENT:");
    println!("    CREDMON_LOG_SOURCE, CREDMON_SITE_ROOT, CREDMON_SITE_FILE, CREDMON_STATE_DIR,");
    println!("    CREDMON_RECORDS_FILE, CREDMON_MONITORS_FILE, CREDMON_POLL_INTERVAL_MS,");
    println!("    CREDMON_RESUME_ACTIVE, RUST_LOG");
}

fn value_of(args: &[String], i: usize, flag: &str) -> Result<String, String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(cmd) = args.first() else {
        return Err("missing command".to_string());
    };
    let rest = &args[1..];

    match cmd.as_str() {
        "watch" => {
            let mut name = None;
            let mut sources = Vec::new();
            let mut domains = Vec::new();
            let mut run_for = None;
            let mut i = 0;
            while i < rest.len() {
                match rest[i].as_str() {
                    "--name" => name = Some(value_of(rest, i, "--name")?),
                    "--source" => {
                        let v = value_of(rest, i, "--source")?;
                        sources.push(v.parse::<SourceKind>()?);
                    }
                    "--domain" => domains.push(value_of(rest, i, "--domain")?),
                    "--for" => {
                        let v = value_of(rest, i, "--for")?;
                        let secs: u64 = v.parse().map_err(|_| format!("invalid duration: {v}"))?;
                        run_for = Some(Duration::from_secs(secs));
                    }
                    other => return Err(format!("unknown option for watch: {other}")),
                }
                i += 2;
            }
            Ok(Command::Watch {
                name,
                sources,
                domains,
                run_for,
            })
        }
        "extract" => Ok(Command::Extract),
        "status" => Ok(Command::Status),
        "reload" => Ok(Command::Reload),
        "clear" => match rest {
            [] => Ok(Command::Clear { monitor: None }),
            [flag, id] if flag == "--monitor" => Ok(Command::Clear {
                monitor: Some(MonitorId::from(id.as_str())),
            }),
            _ => Err("usage: credmon clear [--monitor ID]".to_string()),
        },
        other => Err(format!("unknown command: {other}")),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> MonitorResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| credmon::MonitorError::Parse {
        what: "output".to_string(),
        reason: e.to_string(),
    })?;
    println!("{text}");
    Ok(())
}

fn watch(
    registry: &Registry,
    poll_interval: Duration,
    request: NewMonitor,
    run_for: Option<Duration>,
) -> MonitorResult<()> {
    let id = registry.create_monitor(request)?;
    eprintln!("monitor {id} started");

    let started = Instant::now();
    let mut printed = 0;
    loop {
        thread::sleep(poll_interval);

        let records = registry.list_credentials(Some(&id))?;
        // A concurrent clear can shrink the store under us.
        printed = printed.min(records.len());
        for record in &records[printed..] {
            let line = serde_json::to_string(record).map_err(|e| credmon::MonitorError::Parse {
                what: "record".to_string(),
                reason: e.to_string(),
            })?;
            println!("{line}");
        }
        printed = records.len();

        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }

    registry.stop_monitor(&id)?;
    eprintln!("monitor {id} stopped after capturing {printed} record(s)");
    Ok(())
}

fn run(command: Command, config: EngineConfig) -> MonitorResult<()> {
    let poll_interval = config.poll_interval;
    let registry = Registry::open(config)?;

    match command {
        Command::Watch {
            name,
            sources,
            domains,
            run_for,
        } => {
            let mut request = NewMonitor::new().sources(sources).domains(domains);
            if let Some(name) = name {
                request = request.name(name);
            }
            watch(&registry, poll_interval, request, run_for)
        }
        Command::Extract => {
            let preview = registry.extract_all();
            eprintln!(
                "log source: {}, site source: {}, total: {}",
                preview.log_source.len(),
                preview.site_source.len(),
                preview.total()
            );
            print_json(&preview)
        }
        Command::Status => {
            print_json(&registry.summary()?)?;
            print_json(&registry.list_monitors()?)
        }
        Command::Reload => {
            let merged = registry.force_reload()?;
            println!("{merged}");
            Ok(())
        }
        Command::Clear { monitor } => {
            let removed = registry.clear_credentials(monitor.as_ref())?;
            println!("{removed}");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "credmon=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        usage();
        return ExitCode::SUCCESS;
    }

    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!("run `credmon --help` for usage");
            return ExitCode::from(2);
        }
    };

    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    match run(command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}
