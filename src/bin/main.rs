use std::{
    error::Error,
    fs,
    os::unix::net::UnixListener,
    path::PathBuf,
    sync::mpsc::channel,
    thread,
};

use serde_json::{Value, json};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use nodedaemon::{
    cli::{Cli, Commands, parse_args},
    config::{Instances, ProcessConfig, WatchConfig},
    ipc::{self, RequestKind},
    orchestrator::Orchestrator,
    process::ManagedProcess,
    runtime,
    signals::{self, DaemonSignal},
    state::StateStore,
    watcher::FileWatcher,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Daemon => run_daemon(),
        Commands::Start {
            script,
            name,
            instances,
            interpreter,
            cwd,
            env,
            watch,
            watch_paths,
            max_restarts,
            restart_delay,
            max_restart_delay,
            min_uptime,
            args: script_args,
        } => {
            let config = build_start_config(
                script,
                name,
                instances,
                interpreter,
                cwd,
                env,
                watch,
                watch_paths,
                max_restarts,
                restart_delay,
                max_restart_delay,
                min_uptime,
                script_args,
            )?;
            let response =
                ipc::send_request(RequestKind::Start, serde_json::to_value(&config)?)?;
            let id = response
                .data
                .as_ref()
                .and_then(|data| data.get("id"))
                .and_then(Value::as_str)
                .unwrap_or("?");
            println!("started '{}' ({id})", config.resolved_name());
            Ok(())
        }
        Commands::Stop { target, force } => {
            let response = ipc::send_request(
                RequestKind::Stop,
                json!({ "name": target, "force": force }),
            )?;
            print_process_line(response.data.as_ref());
            Ok(())
        }
        Commands::Restart { target } => {
            let response =
                ipc::send_request(RequestKind::Restart, json!({ "name": target }))?;
            print_process_line(response.data.as_ref());
            Ok(())
        }
        Commands::Delete { target } => {
            ipc::send_request(RequestKind::Delete, json!({ "name": target }))?;
            println!("deleted '{target}'");
            Ok(())
        }
        Commands::List => {
            let response = ipc::send_request(RequestKind::List, Value::Null)?;
            let processes: Vec<ManagedProcess> = response
                .data
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            if processes.is_empty() {
                println!("no managed processes");
                return Ok(());
            }
            println!(
                "{:<24} {:<38} {:<10} {:>8} {:>9}",
                "NAME", "ID", "STATUS", "REPLICAS", "RESTARTS"
            );
            for process in processes {
                let restarts: u32 =
                    process.replicas.iter().map(|r| r.restarts).sum();
                println!(
                    "{:<24} {:<38} {:<10} {:>8} {:>9}",
                    process.name,
                    process.id,
                    process.status.to_string(),
                    process.replicas.len(),
                    restarts
                );
            }
            Ok(())
        }
        Commands::Status { target } => {
            let data = match &target {
                Some(target) => json!({ "name": target }),
                None => Value::Null,
            };
            let response = ipc::send_request(RequestKind::Status, data)?;
            if let Some(data) = response.data {
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
            Ok(())
        }
        Commands::Logs { target, lines } => {
            let response = ipc::send_request(
                RequestKind::Logs,
                json!({ "name": target, "lines": lines }),
            )?;
            if let Some(lines) = response
                .data
                .as_ref()
                .and_then(|data| data.get("lines"))
                .and_then(Value::as_array)
            {
                for line in lines {
                    if let Some(line) = line.as_str() {
                        println!("{line}");
                    }
                }
            }
            Ok(())
        }
        Commands::Ping => {
            ipc::send_request(RequestKind::Ping, Value::Null)?;
            println!("pong");
            Ok(())
        }
        Commands::Shutdown => {
            ipc::send_request(RequestKind::Shutdown, Value::Null)?;
            println!("daemon is shutting down");
            Ok(())
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Runs the supervisor in the foreground: signal intake first (so every
/// later thread inherits the mask), then state recovery, then the control
/// socket.
fn run_daemon() -> Result<(), Box<dyn Error>> {
    runtime::ensure_layout()?;
    let signal_rx = signals::spawn_intake()?;

    let (control_tx, control_rx) = channel();
    {
        let control_tx = control_tx.clone();
        thread::spawn(move || {
            for signal in signal_rx {
                if control_tx.send(signal).is_err() {
                    return;
                }
            }
        });
    }

    let store = StateStore::new(runtime::state_file_path());
    let watcher = FileWatcher::new()?;
    let orchestrator = Orchestrator::bootstrap(store, watcher)?;

    // Log sink: every lifecycle event lands in the supervisor log.
    let events = orchestrator.events().subscribe();
    thread::spawn(move || {
        for event in events {
            match serde_json::to_string(&event) {
                Ok(line) => debug!("event {line}"),
                Err(err) => debug!("unencodable event: {err}"),
            }
        }
    });

    let socket = runtime::socket_path();
    if socket.exists() {
        fs::remove_file(&socket)?;
    }
    let listener = UnixListener::bind(&socket)?;
    info!("nodedaemon listening on {:?}", socket);

    {
        let orchestrator = orchestrator.clone();
        let control_tx = control_tx.clone();
        thread::spawn(move || {
            if let Err(err) = ipc::serve(listener, orchestrator, control_tx) {
                error!("control server failed: {err}");
            }
        });
    }

    loop {
        match control_rx.recv() {
            Ok(DaemonSignal::Reload) => {
                info!("reload requested; restarting running processes");
                let reloaded = orchestrator.reload_all();
                info!("reloaded {reloaded} process(es)");
            }
            Ok(DaemonSignal::Shutdown) => {
                orchestrator.shutdown()?;
                break;
            }
            Err(_) => break,
        }
    }

    let _ = fs::remove_file(&socket);
    info!("nodedaemon stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_start_config(
    script: PathBuf,
    name: Option<String>,
    instances: String,
    interpreter: Option<String>,
    cwd: Option<PathBuf>,
    env: Vec<String>,
    watch: bool,
    watch_paths: Vec<PathBuf>,
    max_restarts: Option<u32>,
    restart_delay: Option<i64>,
    max_restart_delay: Option<i64>,
    min_uptime: Option<u64>,
    args: Vec<String>,
) -> Result<ProcessConfig, Box<dyn Error>> {
    let script = if script.is_absolute() {
        script
    } else {
        fs::canonicalize(&script)?
    };
    let mut config = ProcessConfig::new(script.to_string_lossy().into_owned());
    config.name = name;
    config.instances = parse_instances(&instances)?;
    config.interpreter = interpreter;
    config.cwd = cwd;
    config.args = args;
    for entry in env {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            format!("invalid --env entry '{entry}' (expected KEY=VALUE)")
        })?;
        config.env.insert(key.to_string(), value.to_string());
    }
    config.watch = if !watch_paths.is_empty() {
        let mut absolute = Vec::with_capacity(watch_paths.len());
        for path in watch_paths {
            absolute.push(if path.is_absolute() {
                path
            } else {
                fs::canonicalize(&path)?
            });
        }
        WatchConfig::Paths(absolute)
    } else {
        WatchConfig::Enabled(watch)
    };
    if let Some(max_restarts) = max_restarts {
        config.max_restarts = max_restarts;
    }
    if let Some(restart_delay) = restart_delay {
        config.restart_delay = restart_delay;
    }
    if let Some(max_restart_delay) = max_restart_delay {
        config.max_restart_delay = max_restart_delay;
    }
    if let Some(min_uptime) = min_uptime {
        config.min_uptime = min_uptime;
    }
    Ok(config)
}

fn parse_instances(raw: &str) -> Result<Instances, Box<dyn Error>> {
    if raw == "max" {
        return Ok(Instances::Literal("max".into()));
    }
    let count: u32 = raw
        .parse()
        .map_err(|_| format!("invalid --instances value '{raw}'"))?;
    Ok(Instances::Count(count))
}

fn print_process_line(data: Option<&Value>) {
    let Some(data) = data else {
        return;
    };
    let name = data.get("name").and_then(Value::as_str).unwrap_or("?");
    let status = data.get("status").and_then(Value::as_str).unwrap_or("?");
    println!("'{name}' is now {status}");
}
