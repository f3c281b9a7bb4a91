use std::sync::Arc;
use std::time::Duration;

use facet::Facet;
use figue as args;
use lockwatch_engine::{
    BroadcastPublisher, DEFAULT_HISTORY_LIMIT, IntrospectionProvider, Monitor, MonitorConfig,
};
use lockwatch_locks::LocalProvider;
use lockwatch_types::{Notification, ThreadId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod scenarios;

type AnyResult<T> = Result<T, String>;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Milliseconds between polls.
    #[facet(args::named, default)]
    poll_interval_ms: Option<u64>,
    /// Milliseconds a new deadlock is left alone before automatic resolution.
    #[facet(args::named, default)]
    observation_delay_ms: Option<u64>,
    #[facet(args::named, default)]
    settle_window_ms: Option<u64>,
    /// Retry failed events after this many milliseconds. Off by default.
    #[facet(args::named, default)]
    retry_failed_after_ms: Option<u64>,
    /// Start with auto-resolution off; the monitor only observes.
    #[facet(args::named, default)]
    no_auto: bool,
    /// Refuse all interrupts, as with a remote target.
    #[facet(args::named, default)]
    observe_only: bool,
    /// Print notifications as JSON lines instead of text.
    #[facet(args::named, default)]
    json: bool,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    /// Two threads take two locks in opposite order.
    TwoThreadDeadlock,
    /// Three threads wait on each other in a ring.
    ThreeThreadRing,
    /// Two threads deadlock in plain, non-interruptible acquisition.
    MonitorEntryDeadlock,
    /// Contended but deadlock-free workers.
    Healthy,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config_from_cli(&cli)?;
    let publisher = Arc::new(BroadcastPublisher::new(256));
    let printer = tokio::spawn(print_notifications(publisher.subscribe(), cli.json));
    let monitor = Monitor::new(config, publisher.clone());

    let config = monitor.config();
    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        observation_delay_ms = config.observation_delay.as_millis() as u64,
        auto_resolution = config.auto_resolution,
        "starting lockwatch"
    );

    let provider: Arc<dyn IntrospectionProvider> = if cli.observe_only {
        Arc::new(LocalProvider::observe_only())
    } else {
        Arc::new(LocalProvider::new())
    };
    monitor.attach(provider);

    let shutdown = CancellationToken::new();
    let monitor_task = monitor.spawn(shutdown.clone());

    scenarios::start(&cli.command)?;
    println!("commands: auto | resolve | interrupt <thread> | stats | history | snapshot");
    println!("press Ctrl+C to exit");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| format!("failed waiting for Ctrl+C: {e}"))?;
        }
        result = console(&monitor, cli.json) => result?,
    }

    shutdown.cancel();
    monitor_task
        .await
        .map_err(|e| format!("monitor task failed: {e}"))?;
    printer.abort();

    print_summary(&monitor, cli.json)
}

/// Reads operator commands from stdin until it closes.
async fn console(monitor: &Monitor, json: bool) -> AnyResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| format!("failed reading stdin: {e}"))?
    {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => {}
            (Some("auto"), _) => {
                let ack = monitor.toggle_auto_resolution();
                println!("{}", ack.message);
            }
            (Some("resolve"), _) => {
                let response = monitor.trigger_manual_resolution().await;
                println!(
                    "{} (success={}, threads={})",
                    response.message, response.success, response.affected_thread_count
                );
            }
            (Some("interrupt"), Some(raw)) => match raw.parse::<u64>() {
                Ok(id) => println!("{}", monitor.interrupt_thread(ThreadId(id)).message),
                Err(e) => println!("invalid thread id {raw:?}: {e}"),
            },
            (Some("stats"), _) => print_statistics(monitor, json)?,
            (Some("history"), _) => print_history(monitor, json)?,
            (Some("snapshot"), _) => {
                let snapshot = Notification::Snapshot {
                    payload: monitor.get_snapshot(),
                };
                print_notification(&snapshot, json);
            }
            (Some(other), _) => println!("unknown command {other:?}"),
        }
    }
    // stdin closed: keep running until Ctrl+C
    std::future::pending::<()>().await;
    Ok(())
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("lockwatch")
                .description("Run a lock scenario in-process and watch it for deadlocks")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn config_from_cli(cli: &Cli) -> AnyResult<MonitorConfig> {
    let defaults = MonitorConfig::default();
    let ms = |flag: Option<u64>, env: &str| -> AnyResult<Option<Duration>> {
        let value = match flag {
            Some(v) => Some(v),
            None => match std::env::var(env) {
                Ok(raw) => Some(
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| format!("invalid {env}={raw:?}: {e}"))?,
                ),
                Err(_) => None,
            },
        };
        Ok(value.map(Duration::from_millis))
    };

    Ok(MonitorConfig {
        poll_interval: ms(cli.poll_interval_ms, "LOCKWATCH_POLL_INTERVAL_MS")?
            .unwrap_or(defaults.poll_interval),
        observation_delay: ms(cli.observation_delay_ms, "LOCKWATCH_OBSERVATION_DELAY_MS")?
            .unwrap_or(defaults.observation_delay),
        settle_window: ms(cli.settle_window_ms, "LOCKWATCH_SETTLE_WINDOW_MS")?
            .unwrap_or(defaults.settle_window),
        retry_failed_after: ms(cli.retry_failed_after_ms, "LOCKWATCH_RETRY_FAILED_AFTER_MS")?,
        auto_resolution: !cli.no_auto,
        ..defaults
    })
}

async fn print_notifications(mut rx: broadcast::Receiver<Notification>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(notification) => print_notification(&notification, json),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_notification(notification: &Notification, json: bool) {
    if json {
        match facet_json::to_string(notification) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(%err, "failed to encode notification"),
        }
    } else {
        println!("[{}] {}", notification.kind(), describe(notification));
    }
}

fn describe(notification: &Notification) -> String {
    match notification {
        Notification::Snapshot { payload } => {
            let cycles: Vec<String> = payload
                .cycles
                .iter()
                .map(|c| {
                    c.iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>()
                        .join(" → ")
                })
                .collect();
            format!(
                "detected={} threads={} locks={} cycles=[{}]",
                payload.detected,
                payload.threads.len(),
                payload.locks.len(),
                cycles.join("; ")
            )
        }
        Notification::ResolutionUpdate { payload } => match &payload.attempt {
            Some(attempt) => format!(
                "{} {} {} {}: {}",
                payload.event_id, attempt.id, attempt.method, attempt.outcome, payload.message
            ),
            None => format!("{} {}: {}", payload.event_id, payload.event_state, payload.message),
        },
        Notification::ConfigChange { payload } => payload.message.clone(),
        Notification::TargetChange { payload } => match &payload.target {
            Some(target) => format!("monitoring {target} (can_interrupt={})", payload.can_interrupt),
            None => "not monitoring".to_string(),
        },
    }
}

fn print_summary(monitor: &Monitor, json: bool) -> AnyResult<()> {
    print_statistics(monitor, json)?;
    print_history(monitor, json)
}

fn print_statistics(monitor: &Monitor, json: bool) -> AnyResult<()> {
    let stats = monitor.get_statistics();
    if json {
        let line = facet_json::to_string(&stats).map_err(|e| format!("encode statistics: {e}"))?;
        println!("{line}");
        return Ok(());
    }

    println!(
        "events: {} total, {} resolved ({:.1}%), {} active, avg resolution {:.0} ms, {} attempts",
        stats.total_events,
        stats.resolved_events,
        stats.success_rate,
        stats.active_cycles,
        stats.avg_resolution_time_ms,
        stats.total_attempts
    );
    for count in &stats.method_counts {
        println!("  {:<20} {}", count.method.as_str(), count.count);
    }
    Ok(())
}

fn print_history(monitor: &Monitor, json: bool) -> AnyResult<()> {
    for attempt in monitor.get_history(DEFAULT_HISTORY_LIMIT) {
        if json {
            let line =
                facet_json::to_string(&attempt).map_err(|e| format!("encode attempt: {e}"))?;
            println!("{line}");
        } else {
            println!(
                "{} {} {} [{}] {} ({} ms)",
                attempt.id,
                attempt.event_id,
                attempt.method,
                attempt.outcome,
                attempt.detail,
                attempt.duration_ms
            );
        }
    }
    Ok(())
}
