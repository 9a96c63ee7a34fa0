//! Bounded data fetch.
//!
//! Rows are fetched on a worker thread so a hung source cannot hold a job
//! (and its budget reservation) forever. On timeout the worker is detached
//! and its eventual result discarded. A detached worker keeps its slot in
//! the [`FetchGate`] until the source returns, so a source that never
//! answers can pin at most `limit` threads before further fetches are
//! refused.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::domain::{SourceDescriptor, Table};
use crate::ports::TabularSource;
use crate::{EngineError, Result};

/// Bounds the number of fetch workers alive at once.
#[derive(Debug, Clone)]
pub struct FetchGate {
    running: Arc<AtomicUsize>,
    limit: usize,
}

impl FetchGate {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            running: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Workers currently alive, including detached ones.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Option<FetchSlot> {
        self.running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()
            .map(|_| FetchSlot(Arc::clone(&self.running)))
    }
}

/// Released when the worker holding it exits.
struct FetchSlot(Arc<AtomicUsize>);

impl Drop for FetchSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fetch `descriptor` through `source`, giving up after `timeout`.
///
/// # Errors
/// Returns `EngineError::DataUnavailable` if the source fails, the worker
/// dies, the timeout elapses, or `gate` has no free slot.
pub fn fetch_with_timeout<T>(
    source: Arc<T>,
    descriptor: &SourceDescriptor,
    timeout: Duration,
    gate: &FetchGate,
) -> Result<Table>
where
    T: TabularSource + ?Sized + 'static,
{
    let Some(slot) = gate.acquire() else {
        tracing::warn!(source = descriptor.kind(), limit = gate.limit, "Fetch workers exhausted");
        return Err(EngineError::DataUnavailable(format!(
            "{} fetch workers are still running",
            gate.limit
        )));
    };

    let (tx, rx) = mpsc::channel();
    let worker_descriptor = descriptor.clone();

    thread::Builder::new()
        .name("dpledger-fetch".into())
        .spawn(move || {
            let _slot = slot;
            let result = source.fetch(&worker_descriptor);
            // The receiver is gone if the caller already timed out.
            let _ = tx.send(result);
        })
        .map_err(|e| EngineError::DataUnavailable(format!("cannot start fetch worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(table)) => Ok(table),
        Ok(Err(e)) => Err(EngineError::DataUnavailable(e.to_string())),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(source = descriptor.kind(), ?timeout, "Data fetch timed out");
            Err(EngineError::DataUnavailable(format!(
                "{} source did not respond within {} ms",
                descriptor.kind(),
                timeout.as_millis()
            )))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(EngineError::DataUnavailable(
            "fetch worker exited without a result".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::domain::Datum;
    use crate::ports::SourceError;
    use crate::ErrorKind;

    struct Slow(Duration);

    impl TabularSource for Slow {
        fn fetch(&self, _source: &SourceDescriptor) -> std::result::Result<Table, SourceError> {
            thread::sleep(self.0);
            Ok(Table::new().with_column("x", vec![Datum::Int(1)]))
        }
    }

    struct Broken;

    impl TabularSource for Broken {
        fn fetch(&self, _source: &SourceDescriptor) -> std::result::Result<Table, SourceError> {
            Err(SourceError::Unavailable("table dropped".into()))
        }
    }

    /// Blocks until the sender is dropped.
    struct Hung(Mutex<mpsc::Receiver<()>>);

    impl TabularSource for Hung {
        fn fetch(&self, _source: &SourceDescriptor) -> std::result::Result<Table, SourceError> {
            let _ = self.0.lock().map(|rx| rx.recv());
            Err(SourceError::Unavailable("released".into()))
        }
    }

    fn inline() -> SourceDescriptor {
        SourceDescriptor::Inline { key: "k".into() }
    }

    fn gate() -> FetchGate {
        FetchGate::new(4)
    }

    fn wait_until_idle(gate: &FetchGate) {
        for _ in 0..500 {
            if gate.running() == 0 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("fetch workers did not exit");
    }

    #[test]
    fn test_fetch_within_timeout() {
        let gate = gate();
        let table = fetch_with_timeout(
            Arc::new(Slow(Duration::ZERO)),
            &inline(),
            Duration::from_secs(5),
            &gate,
        )
        .expect("Should fetch");
        assert!(table.column("x").is_some());
        wait_until_idle(&gate);
    }

    #[test]
    fn test_fetch_timeout_is_data_unavailable() {
        let err = fetch_with_timeout(
            Arc::new(Slow(Duration::from_millis(500))),
            &inline(),
            Duration::from_millis(20),
            &gate(),
        )
        .expect_err("Should time out");
        assert_eq!(err.kind(), ErrorKind::DataUnavailable);
    }

    #[test]
    fn test_detached_workers_are_capped() {
        let (release, rx) = mpsc::channel::<()>();
        let hung = Arc::new(Hung(Mutex::new(rx)));
        let gate = FetchGate::new(1);

        let err = fetch_with_timeout(Arc::clone(&hung), &inline(), Duration::from_millis(20), &gate)
            .expect_err("Should time out");
        assert!(err.to_string().contains("did not respond"));
        assert_eq!(gate.running(), 1);

        // The abandoned worker still holds the only slot.
        let err = fetch_with_timeout(
            Arc::new(Slow(Duration::ZERO)),
            &inline(),
            Duration::from_secs(5),
            &gate,
        )
        .expect_err("Should refuse");
        assert_eq!(err.kind(), ErrorKind::DataUnavailable);
        assert!(err.to_string().contains("still running"));

        drop(release);
        wait_until_idle(&gate);
        fetch_with_timeout(Arc::new(Slow(Duration::ZERO)), &inline(), Duration::from_secs(5), &gate)
            .expect("Slot should be free again");
    }

    #[test]
    fn test_source_error_is_data_unavailable() {
        let err = fetch_with_timeout(Arc::new(Broken), &inline(), Duration::from_secs(1), &gate())
            .expect_err("Should fail");
        assert_eq!(err.kind(), ErrorKind::DataUnavailable);
        assert!(err.to_string().contains("table dropped"));
    }
}
