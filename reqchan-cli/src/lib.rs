//! Command-line front ends for reqchan.
//!
//! `reqchan` runs one client session (spawning `reqchan-server`); the
//! `reqchan-server` binary is the data server it talks to.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use reqchan::bridge::transport::{DEFAULT_MAX_MESSAGE, MAX_MESSAGE_LIMIT};
use reqchan::{
    DataServer, HistogramShape, Job, Outcome, ProcessSpawner, ServerConfig, SessionConfig,
    SessionReport, TransportConfig, TransportKind,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise logging to stderr.
///
/// `RUST_LOG` wins if set; otherwise `REQCHAN_LOG` picks the level
/// (debug, info, warn, error). `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("REQCHAN_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("reqchan={level},reqchan_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// How long the client waits for leftover blocking tasks before exiting.
const CLIENT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// reqchan client arguments
#[derive(Parser, Debug)]
#[command(name = "reqchan")]
#[command(version, about = "Fetch samples or a file from the data server over local IPC")]
pub struct ClientCli {
    /// Samples per entity
    #[arg(short = 'n', default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..=15000))]
    pub samples: u32,

    /// Number of entities (patients)
    #[arg(short = 'p', default_value_t = 10, value_parser = clap::value_parser!(i32).range(1..=15))]
    pub entities: i32,

    /// Worker threads, one private channel each
    #[arg(short = 'w', default_value_t = 100, value_parser = clap::value_parser!(u16).range(1..=2000))]
    pub workers: u16,

    /// Bounded buffer capacity
    #[arg(short = 'b', default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=1000))]
    pub buffer: u16,

    /// Max message size in bytes; also the file chunk size
    #[arg(short = 'm', default_value_t = DEFAULT_MAX_MESSAGE as u32, value_parser = clap::value_parser!(u32).range(1..=MAX_MESSAGE_LIMIT as i64))]
    pub max_message: u32,

    /// Transfer this file instead of fetching samples
    #[arg(short = 'f', long = "file")]
    pub filename: Option<String>,

    /// IPC transport: fifo, mq or shm
    #[arg(short = 'i', long = "transport", default_value = "fifo")]
    pub transport: TransportKind,

    /// Sub-stream (ECG lead) to sample
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i32).range(1..=2))]
    pub sub_stream: i32,

    /// Where transferred files are written
    #[arg(long, default_value = "received")]
    pub output_dir: PathBuf,

    /// Directory of `<entity>.csv` sample files served by the server
    #[arg(long, default_value = "BIMDC")]
    pub data_dir: PathBuf,

    /// Directory the server serves files from
    #[arg(long, default_value = "BIMDC")]
    pub file_root: PathBuf,

    /// Directory for named pipes (fifo transport)
    #[arg(long)]
    pub fifo_dir: Option<PathBuf>,

    /// Server executable (default: reqchan-server next to this binary)
    #[arg(long)]
    pub server: Option<PathBuf>,

    /// Seconds to wait for the server to exit after quit
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl ClientCli {
    pub fn job(&self) -> Job {
        match &self.filename {
            Some(filename) => {
                Job::file(filename.clone(), self.max_message, self.output_dir.clone())
            }
            None => Job::Data {
                entities: self.entities,
                samples: self.samples,
                sub_stream: self.sub_stream,
                shape: HistogramShape::default(),
            },
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut transport =
            TransportConfig::new(self.transport).with_max_message_size(self.max_message as usize);
        if let Some(dir) = &self.fifo_dir {
            transport = transport.with_fifo_dir(dir);
        }
        let spawner = match &self.server {
            Some(program) => ProcessSpawner::new(program),
            None => ProcessSpawner::default(),
        };
        SessionConfig::new(self.job())
            .with_transport(transport)
            .with_workers(usize::from(self.workers))
            .with_buffer_capacity(usize::from(self.buffer))
            .with_data_dir(self.data_dir.clone())
            .with_file_root(self.file_root.clone())
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout))
            .with_spawner(std::sync::Arc::new(spawner))
            .fit_message_size()
    }
}

/// reqchan-server arguments
#[derive(Parser, Debug)]
#[command(name = "reqchan-server")]
#[command(version, about = "Data server answering reqchan clients")]
pub struct ServerCli {
    /// Name of the control channel to serve
    #[arg(long)]
    pub control: String,

    /// IPC transport: fifo, mq or shm
    #[arg(long, default_value = "fifo")]
    pub transport: TransportKind,

    /// Max message size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE)]
    pub max_message: usize,

    /// Directory for named pipes (fifo transport)
    #[arg(long)]
    pub fifo_dir: Option<PathBuf>,

    /// Directory of `<entity>.csv` sample files
    #[arg(long, default_value = "BIMDC")]
    pub data_dir: PathBuf,

    /// Directory files are served from
    #[arg(long, default_value = "BIMDC")]
    pub file_root: PathBuf,
}

impl ServerCli {
    pub fn server_config(&self) -> ServerConfig {
        let mut transport =
            TransportConfig::new(self.transport).with_max_message_size(self.max_message);
        if let Some(dir) = &self.fifo_dir {
            transport = transport.with_fifo_dir(dir);
        }
        ServerConfig::new(self.control.clone(), transport)
            .with_data_dir(self.data_dir.clone())
            .with_file_root(self.file_root.clone())
    }
}

/// Run the client: parse arguments, run one session, print the report.
pub fn run_client() -> anyhow::Result<()> {
    let cli = ClientCli::parse();
    let config = cli.session_config();
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(reqchan::run_session(config));
    // A handshake stuck on a dead server must not keep the process alive.
    runtime.shutdown_timeout(CLIENT_SHUTDOWN_GRACE);
    let report = result.context("session failed")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }
    Ok(())
}

/// Run the data server until its client sends quit.
pub fn run_server() -> anyhow::Result<()> {
    let cli = ServerCli::parse();
    let config = cli.server_config();
    DataServer::new(config)
        .run()
        .context("data server failed")?;
    Ok(())
}

/// Human-readable summary printed at the end of a session.
pub fn render_report(report: &SessionReport) -> String {
    let mut out = String::new();
    match &report.outcome {
        Outcome::Histograms { histograms } => out.push_str(&histograms.to_string()),
        Outcome::File { path, bytes } => {
            out.push_str(&format!("wrote {bytes} bytes to {}\n", path.display()));
        }
    }
    out.push_str(&format!(
        "{} requests over {} ({} workers, buffer {}) in {:.3}s\n",
        report.requests,
        report.transport,
        report.workers,
        report.buffer_capacity,
        report.elapsed_secs
    ));
    out
}
