use anyhow::{Context, Result};
use camsentry::config::{CmdSpec, Config};
use camsentry::ingest::ingest_loop;
use camsentry::motion::MotionWorker;
use camsentry::server::{create_router, AppState};
use camsentry::source::spawn_source;
use clap::Parser;
use shared::frame_window::FrameWindow;
use shared::score_stats::{FileStatOut, HttpStatOut, RollingKnnHistogram, ScoreSink};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

const DEFAULT_CMD: &str = r#"{"cmd":["libcamera-vid","-t","0","-n","--framerate","7","--codec","mjpeg","--awb","auto","--width","1920","--height","1080","-o","-"],"retry":"500ms"}"#;

#[derive(Parser, Debug)]
#[command(author, version, about = "Motion-watching MJPEG camera server")]
struct Args {
    /// host:port for HTTP serving (a bare ":port" binds all interfaces)
    #[arg(long, default_value = ":8412")]
    addr: String,

    /// Camera command as JSON {"cmd": [...], "retry": "500ms"}; a literal,
    /// a file path, or "-" for stdin
    #[arg(long, default_value = DEFAULT_CMD)]
    cmd: String,

    /// Capture/motion config as a JSON literal or file path
    #[arg(long)]
    config: Option<String>,

    /// Shorthand for the mjpeg-path capture template (%T expands to the
    /// capture start timestamp)
    #[arg(long)]
    mjpeg: Option<String>,

    /// Log file path (stderr by default)
    #[arg(long)]
    log: Option<PathBuf>,

    /// Append JSON-lines score statistics to this file
    #[arg(long)]
    statlog: Option<PathBuf>,

    /// POST score statistics batches to this URL
    #[arg(long)]
    statlog_url: Option<String>,

    /// More logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    match &args.log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }
    Ok(())
}

fn build_score_sink(args: &Args) -> Result<Option<Arc<dyn ScoreSink>>> {
    if let Some(path) = &args.statlog {
        let out = FileStatOut::open(path)
            .with_context(|| format!("open statlog {}", path.display()))?;
        return Ok(Some(Arc::new(RollingKnnHistogram::new(
            "s",
            1000,
            Arc::new(out),
        ))));
    }
    if let Some(url) = &args.statlog_url {
        return Ok(Some(Arc::new(RollingKnnHistogram::new(
            "s",
            1000,
            Arc::new(HttpStatOut::new(url.clone())),
        ))));
    }
    Ok(None)
}

fn normalize_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut cfg = match &args.config {
        Some(arg) => Config::load(arg)?,
        None => Config::default(),
    };
    if let Some(path) = &args.mjpeg {
        cfg.mjpeg_path = path.clone();
    }
    let cfg = Arc::new(cfg);

    let spec = CmdSpec::load(&args.cmd)?;
    let retry = spec.retry_delay()?;
    let score_sink = build_score_sink(&args)?;

    let window = Arc::new(FrameWindow::default());
    let (blob_tx, blob_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let _source = spawn_source(spec, retry, blob_tx, shutdown_rx.clone());
    tokio::spawn(ingest_loop(window.clone(), blob_rx));
    tokio::spawn(
        MotionWorker::new(window.clone(), cfg.clone(), score_sink, shutdown_rx.clone()).run(),
    );

    let state = Arc::new(AppState {
        window: window.clone(),
    });
    let app = create_router(state);

    let addr = normalize_addr(&args.addr)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("listen on {addr}"))?;
    info!("serving on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    shutdown_tx.send(true).ok();
    info!("shut down");
    Ok(())
}
