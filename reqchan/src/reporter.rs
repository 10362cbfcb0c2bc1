//! Periodic progress logging.
//!
//! The reporter only reads aggregate state (briefly, under its lock) and
//! never mutates it. It stops when its cancellation token fires. In data
//! mode the histogram table is logged at debug level on every tick.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{FileSink, HistogramCollection, TransferProgress};

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// What the reporter watches.
#[derive(Debug, Clone)]
pub enum ReportTarget {
    Histograms {
        state: Arc<Mutex<HistogramCollection>>,
        expected: u64,
    },
    File(Arc<FileSink>),
}

/// One progress reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub done: u64,
    pub expected: u64,
}

impl Snapshot {
    pub fn percent(&self) -> f64 {
        if self.expected == 0 {
            100.0
        } else {
            self.done as f64 * 100.0 / self.expected as f64
        }
    }
}

impl ReportTarget {
    pub fn snapshot(&self) -> Snapshot {
        match self {
            Self::Histograms { state, expected } => Snapshot {
                done: crate::aggregate::lock(state).total(),
                expected: *expected,
            },
            Self::File(sink) => {
                let TransferProgress {
                    transferred, total, ..
                } = sink.progress();
                Snapshot {
                    done: transferred,
                    expected: total,
                }
            }
        }
    }

    /// The full histogram table in data mode; file transfers have none.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Histograms { state, .. } => Some(crate::aggregate::lock(state).to_string()),
            Self::File(_) => None,
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            Self::Histograms { .. } => "samples",
            Self::File(_) => "bytes",
        }
    }
}

/// Log a progress line every `period` until `cancel` fires.
pub fn spawn_reporter(
    target: ReportTarget,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snap = target.snapshot();
                    tracing::info!(
                        done = snap.done,
                        expected = snap.expected,
                        unit = target.unit(),
                        "Progress {:.1}%",
                        snap.percent()
                    );
                    if tracing::enabled!(tracing::Level::DEBUG)
                        && let Some(table) = target.detail()
                    {
                        tracing::debug!("Histograms so far\n{table}");
                    }
                }
            }
        }
        tracing::trace!("Reporter stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::HistogramShape;

    #[tokio::test]
    async fn reporter_stops_on_cancel() {
        let state = Arc::new(Mutex::new(HistogramCollection::for_entities(
            [1],
            HistogramShape::default(),
        )));
        let cancel = CancellationToken::new();
        let handle = spawn_reporter(
            ReportTarget::Histograms {
                state: Arc::clone(&state),
                expected: 4,
            },
            Duration::from_millis(5),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter did not stop")
            .unwrap();
    }

    #[test]
    fn snapshot_reads_histogram_totals() {
        let state = Arc::new(Mutex::new(HistogramCollection::for_entities(
            [1, 2],
            HistogramShape::default(),
        )));
        state.lock().unwrap().update(1, 0.0);
        state.lock().unwrap().update(2, 0.0);
        let target = ReportTarget::Histograms { state, expected: 8 };
        let snap = target.snapshot();
        assert_eq!(snap, Snapshot { done: 2, expected: 8 });
        assert_eq!(snap.percent(), 25.0);
        insta::assert_snapshot!(target.detail().unwrap(), @r"
        entity    total | bins
             1        1 | 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 1 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0
             2        1 | 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 1 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0
        ");
    }

    #[test]
    fn file_progress_has_no_table() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::create(dir.path().join("out.bin"), 10).unwrap());
        let target = ReportTarget::File(sink);
        assert_eq!(target.detail(), None);
        assert_eq!(target.snapshot(), Snapshot { done: 0, expected: 10 });
    }
}
