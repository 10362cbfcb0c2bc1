//! Session - one client run against one data server.
//!
//! Flow:
//! 1. Spawn the server with a fresh control channel name
//! 2. Connect the broker, query the file size (file jobs), mint one channel per worker
//! 3. Start the reporter, the worker pool and the producers
//! 4. Join producers, push one sentinel per worker, join the pool
//! 5. Send Quit on the control channel and wait (bounded) for the server to exit

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::aggregate::{
    FileFold, FileSink, Fold, HistogramCollection, HistogramFold, HistogramShape,
};
use crate::bridge::channel::Channel;
use crate::bridge::codec::decode_request;
use crate::bridge::protocol::{Request, Role};
use crate::bridge::transport::{MAX_MESSAGE_LIMIT, TransportConfig, TransportKind};
use crate::broker::{Broker, BrokerError};
use crate::buffer::BoundedBuffer;
use crate::pool::{PoolError, PoolStats, WorkerPool};
use crate::producer::{spawn_data_producers, spawn_file_producer};
use crate::reporter::{DEFAULT_REPORT_INTERVAL, ReportTarget, spawn_reporter};
use crate::server::{DataServer, SampleSource, ServerConfig, ServerError, ServerStats};

/// Data request: tag + i32 + f64 + i32.
const DATA_REQUEST_LEN: usize = 1 + 4 + 8 + 4;
/// File chunk request without the filename: tag + i64 + i32.
const FILE_REQUEST_HEADER_LEN: usize = 1 + 8 + 4;
/// `rc` + 12 hex digits.
const SESSION_ID_LEN: usize = 14;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one worker is required")]
    NoWorkers,
    #[error("buffer capacity must be at least 1")]
    ZeroCapacity,
    #[error("at least one entity and one sample are required")]
    EmptyDataJob,
    #[error("max message size {size} outside {min}..={max}")]
    MessageSize { size: usize, min: usize, max: usize },
    #[error("chunk size {chunk} must be between 1 and the max message size {max}")]
    ChunkSize { chunk: u32, max: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start server: {0}")]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("server setup did not finish within {0:?}")]
    SetupTimeout(Duration),
    #[error("server did not exit within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("server failed: {0}")]
    Server(#[from] ServerError),
    #[error("server exited with {0}")]
    ServerExit(ExitStatus),
    #[error("server exited before setup finished")]
    ServerGone,
    #[error("failed to prepare output {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start producer: {0}")]
    Producer(#[source] std::io::Error),
    #[error("a producer thread panicked")]
    ProducerPanicked,
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What the session fetches.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// `samples` samples of `sub_stream` for each entity `1..=entities`.
    Data {
        entities: i32,
        samples: u32,
        sub_stream: i32,
        shape: HistogramShape,
    },
    /// Copy `filename` into `output_dir` in `chunk_size` pieces.
    File {
        filename: String,
        chunk_size: u32,
        output_dir: PathBuf,
    },
}

impl Job {
    pub fn data(entities: i32, samples: u32) -> Self {
        Self::Data {
            entities,
            samples,
            sub_stream: 1,
            shape: HistogramShape::default(),
        }
    }

    pub fn file(filename: impl Into<String>, chunk_size: u32, output_dir: impl Into<PathBuf>) -> Self {
        Self::File {
            filename: filename.into(),
            chunk_size,
            output_dir: output_dir.into(),
        }
    }
}

/// Extension point for different server launch strategies.
pub trait ServerSpawner: Send + Sync {
    fn spawn(&self, config: &ServerConfig) -> Result<ServerHandle, SpawnError>;
}

/// Runs the `reqchan-server` binary as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    program: Option<PathBuf>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    /// Explicit program, else `reqchan-server` next to the current
    /// executable, else `reqchan-server` on `PATH`.
    fn program(&self) -> PathBuf {
        if let Some(program) = &self.program {
            return program.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("reqchan-server")))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from("reqchan-server"))
    }
}

impl ServerSpawner for ProcessSpawner {
    fn spawn(&self, config: &ServerConfig) -> Result<ServerHandle, SpawnError> {
        let program = self.program();
        tracing::debug!(program = %program.display(), "Spawning server process");
        let child = Command::new(&program)
            .args(config.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(ServerHandle::Process(child))
    }
}

/// Runs the server on a blocking task inside this process.
#[derive(Clone, Default)]
pub struct InProcessSpawner {
    source: Option<Arc<dyn SampleSource>>,
}

impl InProcessSpawner {
    /// Serve data requests from `source` instead of the CSV directory.
    pub fn with_source(source: Arc<dyn SampleSource>) -> Self {
        Self {
            source: Some(source),
        }
    }
}

impl ServerSpawner for InProcessSpawner {
    fn spawn(&self, config: &ServerConfig) -> Result<ServerHandle, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SpawnError::Other(format!("no tokio runtime: {e}")))?;
        let server = match &self.source {
            Some(source) => DataServer::with_source(config.clone(), Arc::clone(source)),
            None => DataServer::new(config.clone()),
        };
        Ok(ServerHandle::Task(runtime.spawn_blocking(move || server.run())))
    }
}

pub enum ServerHandle {
    Process(Child),
    Task(tokio::task::JoinHandle<Result<ServerStats, ServerError>>),
}

impl ServerHandle {
    /// Wait for the server to finish. In-process servers report their stats.
    pub async fn wait(&mut self) -> Result<Option<ServerStats>, SessionError> {
        match self {
            Self::Process(child) => {
                let status = child.wait().await.map_err(SpawnError::Spawn)?;
                if status.success() {
                    Ok(None)
                } else {
                    Err(SessionError::ServerExit(status))
                }
            }
            Self::Task(handle) => Ok(Some(handle.await??)),
        }
    }

    pub async fn kill(&mut self) {
        match self {
            Self::Process(child) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill server process");
                }
            }
            // A blocking task cannot be interrupted; it ends with its channels.
            Self::Task(handle) => handle.abort(),
        }
    }
}

pub struct SessionConfig {
    pub transport: TransportConfig,
    pub workers: usize,
    pub buffer_capacity: usize,
    pub job: Job,
    /// Sample files for the server's CSV source.
    pub data_dir: PathBuf,
    /// Directory the server serves file transfers from.
    pub file_root: PathBuf,
    pub setup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub report_interval: Duration,
    pub spawner: Arc<dyn ServerSpawner>,
}

impl SessionConfig {
    pub fn new(job: Job) -> Self {
        Self {
            transport: TransportConfig::default(),
            workers: 100,
            buffer_capacity: 1,
            job,
            data_dir: PathBuf::from("BIMDC"),
            file_root: PathBuf::from("BIMDC"),
            setup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            report_interval: DEFAULT_REPORT_INTERVAL,
            spawner: Arc::new(ProcessSpawner::default()),
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_transport_kind(mut self, kind: TransportKind) -> Self {
        self.transport.kind = kind;
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn with_buffer_capacity(mut self, n: usize) -> Self {
        self.buffer_capacity = n;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_file_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_root = dir.into();
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ServerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Smallest max message size every message of this session fits in:
    /// requests, channel names and (for file jobs) one chunk.
    pub fn required_message_size(&self) -> usize {
        let channel_name = SESSION_ID_LEN + 1 + self.workers.max(1).to_string().len();
        let base = DATA_REQUEST_LEN.max(channel_name).max(8);
        match &self.job {
            Job::Data { .. } => base,
            Job::File {
                filename,
                chunk_size,
                ..
            } => base
                .max(FILE_REQUEST_HEADER_LEN + filename.len())
                .max(*chunk_size as usize),
        }
    }

    /// Raise the transport's max message size to [`Self::required_message_size`] if below it.
    pub fn fit_message_size(mut self) -> Self {
        let required = self.required_message_size();
        if self.transport.max_message_size < required {
            tracing::debug!(
                from = self.transport.max_message_size,
                to = required,
                "Raising max message size"
            );
            self.transport.max_message_size = required;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let size = self.transport.max_message_size;
        match &self.job {
            Job::File { chunk_size, .. } if *chunk_size == 0 || *chunk_size as usize > size => {
                return Err(ConfigError::ChunkSize {
                    chunk: *chunk_size,
                    max: size,
                });
            }
            Job::Data {
                entities, samples, ..
            } if *entities < 1 || *samples == 0 => {
                return Err(ConfigError::EmptyDataJob);
            }
            _ => {}
        }
        let min = self.required_message_size();
        if size < min || size > MAX_MESSAGE_LIMIT {
            return Err(ConfigError::MessageSize {
                size,
                min,
                max: MAX_MESSAGE_LIMIT,
            });
        }
        Ok(())
    }
}

/// Final state of a session's aggregate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Histograms { histograms: HistogramCollection },
    File { path: PathBuf, bytes: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: String,
    pub transport: TransportKind,
    pub workers: usize,
    pub buffer_capacity: usize,
    pub requests: u64,
    pub per_worker: Vec<u64>,
    pub elapsed_secs: f64,
    pub outcome: Outcome,
    /// Only known for in-process servers.
    pub server: Option<ServerStats>,
}

enum Aggregate {
    Histograms(Arc<Mutex<HistogramCollection>>),
    File(Arc<FileSink>),
}

fn new_session_id() -> String {
    format!("rc{}", &uuid::Uuid::new_v4().simple().to_string()[..SESSION_ID_LEN - 2])
}

/// Run one session to completion.
pub async fn run_session(config: SessionConfig) -> Result<SessionReport, SessionError> {
    config.validate()?;
    let started = Instant::now();
    let session = new_session_id();
    let transport = config.transport.clone();

    let server_config = ServerConfig::new(&session, transport.clone())
        .with_data_dir(config.data_dir.clone())
        .with_file_root(config.file_root.clone());
    tracing::info!(
        %session,
        transport = %transport.kind,
        workers = config.workers,
        buffer_capacity = config.buffer_capacity,
        max_message_size = transport.max_message_size,
        "Starting session"
    );
    let mut server = config.spawner.spawn(&server_config)?;

    let workers = config.workers;
    let size_query = match &config.job {
        Job::File { filename, .. } => Some(filename.clone()),
        Job::Data { .. } => None,
    };
    let mut handshake = {
        let session = session.clone();
        let transport = transport.clone();
        tokio::task::spawn_blocking(move || setup(&session, transport, workers, size_query))
    };
    let ended = tokio::select! {
        biased;
        done = tokio::time::timeout(config.setup_timeout, &mut handshake) => match done {
            Ok(done) => SetupEnd::Finished(done),
            Err(_) => SetupEnd::TimedOut,
        },
        exited = server.wait() => SetupEnd::ServerExited(exited),
    };
    let (broker, channels, file_size) = match ended {
        SetupEnd::Finished(Ok(Ok(ready))) => ready,
        SetupEnd::Finished(Ok(Err(e))) => {
            // Setup already sent Quit; a live server cleans up after itself.
            finish_server(&mut server, config.shutdown_timeout).await.ok();
            unlink_session(&session, &transport, workers);
            return Err(e);
        }
        SetupEnd::Finished(Err(e)) => {
            server.kill().await;
            unlink_session(&session, &transport, workers);
            return Err(e.into());
        }
        SetupEnd::TimedOut => {
            tracing::error!(timeout = ?config.setup_timeout, "Server setup timed out");
            server.kill().await;
            abandon_setup(&session, &transport, workers, handshake, config.shutdown_timeout)
                .await;
            return Err(SessionError::SetupTimeout(config.setup_timeout));
        }
        SetupEnd::ServerExited(exited) => {
            let err = match exited {
                Ok(_) => SessionError::ServerGone,
                Err(e) => e,
            };
            tracing::error!(error = %err, "Server exited during setup");
            abandon_setup(&session, &transport, workers, handshake, config.shutdown_timeout)
                .await;
            return Err(err);
        }
    };
    tracing::debug!(channels = channels.len(), "Private channels ready");

    let aggregate = match prepare_aggregate(&config.job, file_size) {
        Ok(aggregate) => aggregate,
        Err(e) => {
            release(broker, channels);
            finish_server(&mut server, config.shutdown_timeout).await.ok();
            return Err(e);
        }
    };

    let (fold, target, expected): (Arc<dyn Fold>, ReportTarget, u64) = match &aggregate {
        Aggregate::Histograms(state) => {
            let expected = match &config.job {
                Job::Data {
                    entities, samples, ..
                } => *entities as u64 * u64::from(*samples),
                Job::File { .. } => 0,
            };
            (
                Arc::new(HistogramFold::new(Arc::clone(state))),
                ReportTarget::Histograms {
                    state: Arc::clone(state),
                    expected,
                },
                expected,
            )
        }
        Aggregate::File(sink) => (
            Arc::new(FileFold::new(Arc::clone(sink))),
            ReportTarget::File(Arc::clone(sink)),
            file_size.unwrap_or(0),
        ),
    };

    let cancel = CancellationToken::new();
    let reporter = spawn_reporter(target, config.report_interval, cancel.clone());

    let job = config.job.clone();
    let capacity = config.buffer_capacity;
    let pipeline = tokio::task::spawn_blocking(move || {
        run_pipeline(channels, capacity, fold, &job, file_size.unwrap_or(0))
    })
    .await;

    cancel.cancel();
    if let Err(e) = reporter.await {
        tracing::warn!(error = %e, "Reporter task failed");
    }

    let quit = tokio::task::spawn_blocking(move || broker.quit()).await;
    let server_stats = finish_server(&mut server, config.shutdown_timeout).await;

    let pool_stats = pipeline??;
    quit??;
    let server_stats = server_stats?;

    let outcome = match aggregate {
        Aggregate::Histograms(state) => Outcome::Histograms {
            histograms: crate::aggregate::lock(&state).clone(),
        },
        Aggregate::File(sink) => {
            sink.sync().map_err(|source| SessionError::Output {
                path: sink.path().to_path_buf(),
                source,
            })?;
            Outcome::File {
                path: sink.path().to_path_buf(),
                bytes: sink.progress().transferred,
            }
        }
    };

    let elapsed = started.elapsed();
    tracing::info!(
        %session,
        requests = pool_stats.total(),
        expected,
        elapsed_secs = elapsed.as_secs_f64(),
        "Session complete"
    );
    Ok(SessionReport {
        session,
        transport: transport.kind,
        workers,
        buffer_capacity: capacity,
        requests: pool_stats.total(),
        per_worker: pool_stats.completed,
        elapsed_secs: elapsed.as_secs_f64(),
        outcome,
        server: server_stats,
    })
}

type Ready = (Broker, Vec<Channel>, Option<u64>);

enum SetupEnd {
    Finished(Result<Result<Ready, SessionError>, tokio::task::JoinError>),
    TimedOut,
    ServerExited(Result<Option<ServerStats>, SessionError>),
}

fn setup(
    control: &str,
    transport: TransportConfig,
    workers: usize,
    size_query: Option<String>,
) -> Result<Ready, SessionError> {
    let mut broker = Broker::connect(control, transport)?;
    let file_size = match size_query {
        Some(filename) => match broker.file_size(&filename) {
            Ok(size) => Some(size),
            Err(e) => {
                release(broker, Vec::new());
                return Err(e.into());
            }
        },
        None => None,
    };
    let mut channels = Vec::with_capacity(workers);
    for _ in 0..workers {
        match broker.new_channel() {
            Ok(channel) => channels.push(channel),
            Err(e) => {
                release(broker, channels);
                return Err(e.into());
            }
        }
    }
    Ok((broker, channels, file_size))
}

/// Quit every channel so the server can shut down after a failed setup.
fn release(broker: Broker, channels: Vec<Channel>) {
    for mut channel in channels {
        if let Err(e) = channel.notify(&Request::Quit) {
            tracing::warn!(channel = channel.name(), error = %e, "Failed to release channel");
        }
    }
    if let Err(e) = broker.quit() {
        tracing::warn!(error = %e, "Failed to send quit on control channel");
    }
}

/// Clean up after a server that died or hung mid-handshake.
///
/// A stand-in answers the control channel until the blocked handshake gives
/// up and quits; then every name the session may have created is unlinked.
/// Both waits are bounded by `grace`.
async fn abandon_setup(
    session: &str,
    transport: &TransportConfig,
    workers: usize,
    handshake: tokio::task::JoinHandle<Result<Ready, SessionError>>,
    grace: Duration,
) {
    let stand_in = (!handshake.is_finished()).then(|| {
        let session = session.to_string();
        let transport = transport.clone();
        tokio::task::spawn_blocking(move || refuse_until_quit(&session, &transport))
    });

    match tokio::time::timeout(grace, handshake).await {
        Ok(Ok(Ok((broker, channels, _)))) => {
            tokio::task::spawn_blocking(move || release(broker, channels))
                .await
                .ok();
        }
        Ok(Ok(Err(e))) => tracing::debug!(error = %e, "Handshake gave up"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Handshake task failed"),
        Err(_) => tracing::warn!(?grace, "Handshake still blocked, abandoning it"),
    }
    if let Some(stand_in) = stand_in
        && tokio::time::timeout(grace, stand_in).await.is_err()
    {
        tracing::warn!(?grace, "Control channel stand-in still blocked, abandoning it");
    }
    unlink_session(session, transport, workers);
}

/// Answer every control request with an empty payload until Quit.
///
/// One unsolicited empty reply goes out first, for a request the dead server
/// took with it.
fn refuse_until_quit(control: &str, transport: &TransportConfig) {
    let mut channel = match Channel::open(control, Role::Responder, transport) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(channel = control, error = %e, "Failed to take over control channel");
            return;
        }
    };
    if let Err(e) = channel.write(&[]) {
        tracing::debug!(channel = control, error = %e, "Stand-in could not reply");
        return;
    }
    loop {
        let msg = match channel.read() {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(channel = control, error = %e, "Stand-in stopped reading");
                break;
            }
        };
        if matches!(decode_request(&msg), Ok(Request::Quit)) {
            break;
        }
        if channel.write(&[]).is_err() {
            break;
        }
    }
    channel.close();
}

/// Unlink the control channel and every private channel name the server
/// could have minted. Missing objects are ignored.
fn unlink_session(session: &str, transport: &TransportConfig, workers: usize) {
    transport.unlink(session);
    for n in 0..workers {
        transport.unlink(&format!("{session}_{n}"));
    }
    tracing::debug!(%session, "Unlinked session channels");
}

fn prepare_aggregate(job: &Job, file_size: Option<u64>) -> Result<Aggregate, SessionError> {
    match job {
        Job::Data {
            entities, shape, ..
        } => Ok(Aggregate::Histograms(Arc::new(Mutex::new(
            HistogramCollection::for_entities(1..=*entities, *shape),
        )))),
        Job::File {
            filename,
            output_dir,
            ..
        } => {
            let output = |source: std::io::Error| SessionError::Output {
                path: output_dir.clone(),
                source,
            };
            std::fs::create_dir_all(output_dir).map_err(output)?;
            let path = output_path(output_dir, filename);
            let sink = FileSink::create(&path, file_size.unwrap_or(0))
                .map_err(|source| SessionError::Output { path, source })?;
            Ok(Aggregate::File(Arc::new(sink)))
        }
    }
}

fn output_path(dir: &Path, filename: &str) -> PathBuf {
    // Only the final component; the server rejects anything else anyway.
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "received.bin".into());
    dir.join(name)
}

fn run_pipeline(
    channels: Vec<Channel>,
    capacity: usize,
    fold: Arc<dyn Fold>,
    job: &Job,
    file_size: u64,
) -> Result<PoolStats, SessionError> {
    let buffer = Arc::new(BoundedBuffer::new(capacity));
    let pool = WorkerPool::spawn(channels, Arc::clone(&buffer), fold)?;

    let producers = match job {
        Job::Data {
            entities,
            samples,
            sub_stream,
            ..
        } => spawn_data_producers(&buffer, 1..=*entities, *samples, *sub_stream),
        Job::File {
            filename,
            chunk_size,
            ..
        } => spawn_file_producer(&buffer, filename.clone(), file_size, *chunk_size)
            .map(|h| vec![h]),
    };

    let mut failure = None;
    match producers {
        Ok(handles) => {
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("Producer thread panicked");
                    failure.get_or_insert(SessionError::ProducerPanicked);
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to start producers");
            failure = Some(SessionError::Producer(e));
        }
    }

    for _ in 0..pool.len() {
        buffer.push_sentinel();
    }
    let stats = pool.join()?;
    match failure {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

/// Wait for the server to exit, killing it after `timeout`.
async fn finish_server(
    server: &mut ServerHandle,
    timeout: Duration,
) -> Result<Option<ServerStats>, SessionError> {
    match tokio::time::timeout(timeout, server.wait()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(?timeout, "Server did not exit in time, killing it");
            server.kill().await;
            Err(SessionError::ShutdownTimeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::SAMPLE_INTERVAL;

    fn ecg_like() -> Arc<dyn SampleSource> {
        Arc::new(|entity: i32, t: f64, _sub: i32| {
            let index = (t / SAMPLE_INTERVAL).round();
            f64::from(entity) + 0.1 * index
        })
    }

    fn transport(kind: TransportKind, dir: &Path) -> TransportConfig {
        TransportConfig::new(kind).with_fifo_dir(dir)
    }

    async fn histogram_scenario(kind: TransportKind) {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new(Job::data(2, 2))
            .with_transport(transport(kind, dir.path()))
            .with_workers(2)
            .with_buffer_capacity(1)
            .with_spawner(Arc::new(InProcessSpawner::with_source(ecg_like())));

        let report = run_session(config).await.unwrap();
        assert_eq!(report.requests, 4);
        assert_eq!(report.per_worker.len(), 2);

        let mut expected = HistogramCollection::for_entities([1, 2], HistogramShape::default());
        for (entity, value) in [(1, 1.0), (1, 1.1), (2, 2.0), (2, 2.1)] {
            expected.update(entity, value);
        }
        let Outcome::Histograms { histograms } = &report.outcome else {
            panic!("expected histograms");
        };
        assert_eq!(histograms.get(1).unwrap().counts(), expected.get(1).unwrap().counts());
        assert_eq!(histograms.get(2).unwrap().counts(), expected.get(2).unwrap().counts());
        assert_eq!(histograms.total(), 4);

        let server = report.server.unwrap();
        assert_eq!(server.channels, 2);
        assert_eq!(server.requests, 4);
        assert_eq!(server.failed_channels, 0);

        let leftover = transport(kind, dir.path());
        for name in [
            report.session.clone(),
            format!("{}_0", report.session),
            format!("{}_1", report.session),
        ] {
            assert!(!leftover.resources_exist(&name), "{kind}: {name} left behind");
        }
    }

    async fn file_scenario(kind: TransportKind) {
        let dir = tempfile::tempdir().unwrap();
        let files = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(files.path().join("ten.bin"), b"0123456789").unwrap();

        let config = SessionConfig::new(Job::file("ten.bin", 4, out.path()))
            .with_transport(transport(kind, dir.path()))
            .with_workers(2)
            .with_buffer_capacity(2)
            .with_file_root(files.path())
            .with_spawner(Arc::new(InProcessSpawner::default()));

        let report = run_session(config).await.unwrap();
        assert_eq!(report.requests, 3);
        let Outcome::File { path, bytes } = &report.outcome else {
            panic!("expected file outcome");
        };
        assert_eq!(*bytes, 10);
        assert_eq!(std::fs::read(path).unwrap(), b"0123456789");
        assert!(!transport(kind, dir.path()).resources_exist(&report.session));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn histograms_over_fifo() {
        histogram_scenario(TransportKind::Fifo).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn histograms_over_message_queue() {
        histogram_scenario(TransportKind::MessageQueue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn histograms_over_shared_memory() {
        histogram_scenario(TransportKind::SharedMemory).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_over_fifo() {
        file_scenario(TransportKind::Fifo).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_over_message_queue() {
        file_scenario(TransportKind::MessageQueue).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_over_shared_memory() {
        file_scenario(TransportKind::SharedMemory).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_file_shuts_server_down() {
        let files = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let config = SessionConfig::new(Job::file("absent.bin", 4, out.path()))
            .with_transport(TransportConfig::new(TransportKind::MessageQueue))
            .with_workers(1)
            .with_file_root(files.path())
            .with_spawner(Arc::new(InProcessSpawner::default()));
        let err = run_session(config).await.unwrap_err();
        assert!(matches!(err, SessionError::Broker(BrokerError::NoSuchFile(_))));
    }

    /// Run a session against a server that exits at once, then make sure
    /// the runtime can still shut down (no handshake thread left blocked).
    fn dead_server_session(kind: TransportKind, fifo_dir: &Path) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let config = SessionConfig::new(Job::data(1, 1))
            .with_transport(transport(kind, fifo_dir))
            .with_workers(2)
            .with_setup_timeout(Duration::from_secs(30))
            .with_shutdown_timeout(Duration::from_secs(2))
            .with_spawner(Arc::new(ProcessSpawner::new("false")));

        let started = Instant::now();
        let err = runtime.block_on(run_session(config)).unwrap_err();
        assert!(matches!(err, SessionError::ServerExit(_)), "{kind}: {err}");
        assert!(started.elapsed() < Duration::from_secs(10), "{kind}: waited for the setup timeout");

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            drop(runtime);
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|_| panic!("{kind}: runtime still pinned by a blocked handshake"));
    }

    #[test]
    fn dead_server_over_fifo_leaves_no_pipes() {
        let dir = tempfile::tempdir().unwrap();
        dead_server_session(TransportKind::Fifo, dir.path());
        let left: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(left.is_empty(), "pipes left behind: {left:?}");
    }

    #[test]
    fn dead_server_over_message_queue() {
        let dir = tempfile::tempdir().unwrap();
        dead_server_session(TransportKind::MessageQueue, dir.path());
    }

    #[test]
    fn dead_server_over_shared_memory() {
        let dir = tempfile::tempdir().unwrap();
        dead_server_session(TransportKind::SharedMemory, dir.path());
    }

    /// Serves the session in-process but hands back a process that ignores
    /// the quit.
    struct LingeringSpawner;

    impl ServerSpawner for LingeringSpawner {
        fn spawn(&self, config: &ServerConfig) -> Result<ServerHandle, SpawnError> {
            let server = DataServer::with_source(config.clone(), ecg_like());
            std::thread::spawn(move || server.run());
            let child = Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()?;
            Ok(ServerHandle::Process(child))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lingering_server_is_killed_after_shutdown_timeout() {
        let config = SessionConfig::new(Job::data(1, 2))
            .with_transport(TransportConfig::new(TransportKind::MessageQueue))
            .with_workers(1)
            .with_shutdown_timeout(Duration::from_millis(300))
            .with_spawner(Arc::new(LingeringSpawner));

        let started = Instant::now();
        let err = run_session(config).await.unwrap_err();
        assert!(matches!(err, SessionError::ShutdownTimeout(t) if t == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn validation_rejects_bad_sizes() {
        let config = SessionConfig::new(Job::data(2, 2)).with_workers(0);
        assert!(matches!(config.validate(), Err(ConfigError::NoWorkers)));

        let config = SessionConfig::new(Job::data(2, 2)).with_buffer_capacity(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroCapacity)));

        let config = SessionConfig::new(Job::file("f", 512, "out"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ChunkSize { chunk: 512, max: 256 })
        ));

        let config = SessionConfig::new(Job::data(2, 2))
            .with_transport(TransportConfig::default().with_max_message_size(4));
        assert!(matches!(config.validate(), Err(ConfigError::MessageSize { size: 4, .. })));
        assert!(config.fit_message_size().validate().is_ok());
    }

    #[test]
    fn required_size_covers_names_and_chunks() {
        let config = SessionConfig::new(Job::data(1, 1)).with_workers(2000);
        // "rc" + 12 hex + "_" + "2000"
        assert_eq!(config.required_message_size(), 19);
        let config = SessionConfig::new(Job::file("x.csv", 100, "out")).with_workers(1);
        assert_eq!(config.required_message_size(), 100);
    }

    #[test]
    fn session_ids_fit_declared_length() {
        let id = new_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id.starts_with("rc"));
    }
}
