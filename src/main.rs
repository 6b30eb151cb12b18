//! Trading-operations control plane entry point.
//!
//! `start` boots the event bus, wires every decision module (spec §4
//! components D-N) onto it through the [`opsctl::lifecycle::Registry`], and
//! exposes a small local control surface (`status`, `reload`, `shutdown`)
//! that the other CLI subcommands talk to over a plain HTTP request — the
//! teacher's `route_quality_monitor` binary uses the same clap + axum +
//! tracing combination for a standalone monitoring process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use opsctl::audit::AuditSink;
use opsctl::bus::EventBus;
use opsctl::clock::Scheduler;
use opsctl::config::{FileConfig, HotReloadable};
use opsctl::lifecycle::{Module, Registry};
use opsctl::modules::allocator::SpotAllocator;
use opsctl::modules::anomaly::{AnomalyConfig, AnomalyDetector};
use opsctl::modules::balancer::PortfolioBalancer;
use opsctl::modules::dialog::OperatorDialog;
use opsctl::modules::drawdown::DrawdownMonitor;
use opsctl::modules::explain::ExplainabilityReporter;
use opsctl::modules::failover::FailoverOrchestrator;
use opsctl::modules::guardrail::GuardrailBridge;
use opsctl::modules::log_router::LogIngestRouter;
use opsctl::modules::pacing::PacingPlanner;
use opsctl::modules::pii::PiiGuard;

const DEFAULT_CONTROL_PORT: u16 = 7878;
const DEFAULT_CONFIG_PATH: &str = "opsctl.toml";

#[derive(Parser, Debug)]
#[command(name = "opsctl")]
#[command(about = "Trading-operations control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Local control port used by `reload`/`status`/`shutdown` to reach a
    /// running `start` process.
    #[arg(long, env = "OPSCTL_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot the control plane: event bus, every decision module, the clock
    /// scheduler, and the local control surface.
    Start {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Atomically reload one hot-reloadable config section on a running
    /// process (spec §6 "Hot-reload supported only for: routing rules,
    /// privacy rules, endpoint catalog, policy caps").
    Reload {
        #[arg(value_parser = ["routes", "privacy", "policy", "endpoints"])]
        section: String,
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Print the health snapshot of every registered module.
    Status,
    /// Request a graceful shutdown with an optional grace period.
    Shutdown {
        #[arg(long, default_value_t = 5_000)]
        grace: u64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

struct ControlState {
    registry: Arc<Registry>,
    hot: Arc<HotReloadable>,
    pii: Arc<PiiGuard>,
    balancer: Arc<PortfolioBalancer>,
    failover: Arc<FailoverOrchestrator>,
    log_router: Arc<LogIngestRouter>,
    shutdown: Arc<tokio::sync::Notify>,
}

async fn status_handler(State(state): State<Arc<ControlState>>) -> Json<serde_json::Value> {
    let snapshot = state.registry.health_snapshot().await;
    Json(serde_json::json!(snapshot
        .into_iter()
        .map(|(name, health)| (name, serde_json::json!({"state": health.state, "detail": health.detail})))
        .collect::<std::collections::HashMap<_, _>>()))
}

async fn reload_handler(
    State(state): State<Arc<ControlState>>,
    AxumPath(section): AxumPath<String>,
    body: String,
) -> Json<serde_json::Value> {
    let path = PathBuf::from(body.trim());
    match state.hot.reload_from_file(&section, &path) {
        Ok(()) => {
            match section.as_str() {
                "routes" => state.log_router.update_rules((**state.hot.routing_rules.load()).clone()),
                "privacy" => {
                    let rules = (**state.hot.privacy.load()).clone();
                    state.pii.update_rules(rules.clone());
                    state.log_router.update_privacy(rules);
                }
                "endpoints" => state.failover.update_catalog((**state.hot.endpoints.load()).clone()),
                "policy" => state.balancer.update_caps((**state.hot.policy_caps.load()).clone()),
                _ => {}
            }
            info!(section = %section, "hot-reload applied");
            Json(serde_json::json!({"ok": true}))
        }
        Err(e) => {
            warn!(section = %section, error = %e, "hot-reload failed");
            Json(serde_json::json!({"ok": false, "error": e.to_string()}))
        }
    }
}

async fn shutdown_handler(State(state): State<Arc<ControlState>>) -> Json<serde_json::Value> {
    state.shutdown.notify_waiters();
    Json(serde_json::json!({"ok": true}))
}

async fn run_start(config_path: PathBuf, control_port: u16) -> anyhow::Result<i32> {
    dotenv::dotenv().ok();
    let file_config = match FileConfig::load(&config_path) {
        Ok(cfg) => cfg.apply_env_overrides(),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Ok(3);
        }
    };

    let bus = EventBus::new();
    let audit = Arc::new(
        AuditSink::open(PathBuf::from("./opsctl-audit.jsonl"))
            .await?
            .with_bus(bus.clone()),
    );
    let registry = Arc::new(Registry::new(bus.clone(), audit.clone()));
    let hot = HotReloadable::from_file(&file_config);

    let pii = PiiGuard::new(audit.clone(), file_config.privacy.clone());
    let drawdown = DrawdownMonitor::new(audit.clone(), file_config.drawdown.clone());
    let failover = FailoverOrchestrator::new(audit.clone(), file_config.endpoints.clone());
    let pacing = PacingPlanner::new(audit.clone(), file_config.pacing.clone());
    let balancer = PortfolioBalancer::new(audit.clone(), file_config.balancer.clone());
    let allocator = SpotAllocator::new(audit.clone(), Default::default());
    let guardrail = GuardrailBridge::new(audit.clone(), Default::default());
    let dialog = OperatorDialog::new(audit.clone(), file_config.dialog.clone());
    let anomaly = AnomalyDetector::new(audit.clone(), AnomalyConfig::default());
    let log_router = LogIngestRouter::new(audit.clone(), Default::default(), file_config.privacy.clone());
    log_router.update_rules(file_config.routing_rules.clone());
    let explain = ExplainabilityReporter::new(audit.clone());

    registry.register(pii.clone());
    registry.register(drawdown.clone());
    registry.register(failover.clone());
    registry.register(pacing.clone());
    registry.register(balancer.clone());
    registry.register(allocator.clone());
    registry.register(guardrail.clone());
    registry.register(dialog.clone());
    registry.register(anomaly.clone());
    registry.register(log_router.clone());
    registry.register(explain.clone());

    let configs = std::collections::HashMap::new();
    if let Err(e) = registry.start_all(&configs).await {
        error!(error = %e, "module init failed");
        return Ok(1);
    }

    let scheduler = Scheduler::new(bus.clone());
    scheduler.start_tick_1m();

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let control_state = Arc::new(ControlState {
        registry: registry.clone(),
        hot,
        pii,
        balancer,
        failover,
        log_router,
        shutdown: shutdown.clone(),
    });

    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status_handler))
        .route("/reload/:section", post(reload_handler))
        .route("/shutdown", post(shutdown_handler))
        .with_state(control_state);

    let addr = SocketAddr::from(([127, 0, 0, 1], control_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "control surface listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "control surface exited");
        }
    });

    tokio::select! {
        _ = shutdown.notified() => {
            info!("shutdown requested via control surface");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C");
        }
    }

    server.abort();
    scheduler.shutdown();
    registry.shutdown_all(5_000).await;
    Ok(0)
}

/// Minimal HTTP/1.1 client used by `reload`/`status`/`shutdown` to reach a
/// `start` process's control surface without a full HTTP client dependency.
async fn control_request(
    port: u16,
    method: &str,
    path: &str,
    body: &str,
) -> anyhow::Result<String> {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    let body = response.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
    Ok(body)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Start { config } => run_start(config, cli.control_port).await?,
        Command::Reload { section, config } => {
            let body = config.display().to_string();
            match control_request(cli.control_port, "POST", &format!("/reload/{section}"), &body).await {
                Ok(resp) => {
                    println!("{resp}");
                    0
                }
                Err(e) => {
                    error!(error = %e, "reload request failed");
                    2
                }
            }
        }
        Command::Status => match control_request(cli.control_port, "GET", "/status", "").await {
            Ok(resp) => {
                println!("{resp}");
                0
            }
            Err(e) => {
                error!(error = %e, "status request failed");
                2
            }
        },
        Command::Shutdown { grace } => {
            info!(grace_ms = grace, "requesting shutdown");
            match control_request(cli.control_port, "POST", "/shutdown", "").await {
                Ok(resp) => {
                    println!("{resp}");
                    0
                }
                Err(e) => {
                    error!(error = %e, "shutdown request failed");
                    2
                }
            }
        }
    };

    std::process::exit(exit_code);
}
