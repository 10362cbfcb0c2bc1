//! reqchan: request/response channels between local processes.
//!
//! A client fans a request stream through a bounded buffer to a pool of
//! workers, each holding a private channel to the data server, and folds
//! the responses into shared state.

pub mod aggregate;
pub mod bridge;
pub mod broker;
pub mod buffer;
pub mod pool;
pub mod producer;
pub mod reporter;
pub mod server;
pub mod session;

pub use aggregate::{
    Fold, FoldError, HistogramCollection, HistogramShape, ShapeError, TransferProgress,
};
pub use bridge::channel::{Channel, ChannelError};
pub use bridge::protocol::{DataRequest, FileChunkRequest, Request, Role};
pub use bridge::transport::{TransportConfig, TransportError, TransportKind};
pub use broker::{Broker, BrokerError};
pub use buffer::BoundedBuffer;
pub use pool::{PoolError, PoolStats, WorkerPool};
pub use server::{DataServer, SampleSource, ServerConfig, ServerError, ServerStats};
pub use session::{
    ConfigError, InProcessSpawner, Job, Outcome, ProcessSpawner, ServerSpawner, SessionConfig,
    SessionError, SessionReport, run_session,
};
