//! One chunked encrypt or decrypt run from a source to a sink.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xipher_core::{Mode, XipherError};
use xipher_engine::{Engine, EngineError, KeyOrPassword, RawEngine, Transformer};

use crate::progress::ProgressReporter;
use crate::sink::ByteSink;
use crate::status::StreamStatus;

/// Errors that keep a job from running at all.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The engine refused to open a transformer.
    #[error("{0}")]
    Open(#[source] EngineError),

    /// Another job is still running in this session.
    #[error("another stream job is still running")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<StreamError> for XipherError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Open(e) => e.into(),
            StreamError::Io(e) => XipherError::Io(e),
            other => XipherError::Stream(other.to_string()),
        }
    }
}

/// Why a started job ended FAILED.
#[derive(Debug, Error)]
pub enum PipelineFailure {
    #[error("reading input: {0}")]
    Source(#[source] io::Error),

    #[error("{0}")]
    Transform(#[source] EngineError),

    #[error("writing output: {0}")]
    Sink(#[source] io::Error),
}

/// Final state of a job that got past opening its transformer.
#[derive(Debug)]
pub struct JobOutcome {
    pub status: StreamStatus,
    pub processed_size: u64,
    pub failure: Option<PipelineFailure>,
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == StreamStatus::Completed
    }
}

/// State shared between a job and its handles.
struct Shared {
    mode: Mode,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
    processed: AtomicU64,
    /// Serializes reporter calls and guards the CANCELLING/terminal decision.
    report_lock: Mutex<Option<StreamStatus>>,
    ended: watch::Sender<Option<StreamStatus>>,
}

impl Shared {
    fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Skipped once cancellation was requested so CANCELLING is only
    /// followed by the terminal status.
    fn report_processing(&self) {
        let mut last = self.report_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.ended.borrow().is_some() || self.cancel.is_cancelled() {
            return;
        }
        *last = Some(StreamStatus::Processing);
        self.reporter.report(self.processed(), StreamStatus::Processing);
    }

    /// Report `CANCELLING` once. No-op after the job ended.
    fn cancel(&self) {
        let mut last = self.report_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.ended.borrow().is_some() || self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        *last = Some(StreamStatus::Cancelling);
        self.reporter.report(self.processed(), StreamStatus::Cancelling);
    }

    /// Decide and report the terminal status. Returns what was reported.
    fn finish(&self, failed: bool) -> StreamStatus {
        let mut last = self.report_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = *self.ended.borrow() {
            return status;
        }
        let status = if failed {
            StreamStatus::Failed
        } else if self.cancel.is_cancelled() {
            StreamStatus::Cancelled
        } else {
            StreamStatus::Completed
        };
        *last = Some(status);
        self.reporter.report(self.processed(), status);
        self.ended.send_replace(Some(status));
        status
    }

    /// End without reporting. Used when the job never started.
    fn end_silently(&self, status: StreamStatus) {
        let mut last = self.report_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.ended.borrow().is_some() {
            return;
        }
        *last = Some(status);
        self.ended.send_replace(Some(status));
    }

    /// End a job that will never run. A requested cancel still gets its
    /// terminal CANCELLED report.
    fn abandon(&self) {
        if self.cancel.is_cancelled() {
            self.finish(false);
        } else {
            self.end_silently(StreamStatus::Cancelled);
        }
    }
}

/// Observer and cancel control for a [`StreamJob`]. Cheap to clone.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<Shared>,
}

impl JobHandle {
    /// Ask the job to stop at the next chunk boundary.
    ///
    /// The first call reports `CANCELLING` right away; later calls and calls
    /// after the job ended do nothing.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// True once the terminal status has been reported.
    pub fn is_ended(&self) -> bool {
        self.shared.ended.borrow().is_some()
    }

    /// Wait for the terminal status.
    pub async fn wait_ended(&self) -> StreamStatus {
        let mut ended = self.shared.ended.subscribe();
        loop {
            if let Some(status) = *ended.borrow_and_update() {
                return status;
            }
            // The sender lives in `shared`, which this handle keeps alive.
            if ended.changed().await.is_err() {
                return StreamStatus::Failed;
            }
        }
    }

    pub fn processed_size(&self) -> u64 {
        self.shared.processed()
    }

    /// Last reported status, if any.
    pub fn status(&self) -> Option<StreamStatus> {
        *self
            .shared
            .report_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    pub(crate) fn same_job(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("mode", &self.shared.mode)
            .field("processed", &self.processed_size())
            .field("status", &self.status())
            .finish()
    }
}

/// Reports CANCELLED if an opened job is dropped before it finished.
struct EndGuard {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel.cancel();
            let status = self.shared.finish(false);
            debug!(%status, "stream job dropped before it finished");
        }
    }
}

/// Sink wrapper that aborts at most once and never after a close.
struct Outlet<'a, K> {
    sink: &'a mut K,
    finished: bool,
}

impl<'a, K: ByteSink> Outlet<'a, K> {
    fn new(sink: &'a mut K) -> Self {
        Self {
            sink,
            finished: false,
        }
    }

    async fn push(&mut self, chunk: Vec<u8>) -> Result<(), PipelineFailure> {
        self.sink
            .push(Bytes::from(chunk))
            .await
            .map_err(PipelineFailure::Sink)
    }

    async fn close(&mut self) -> Result<(), PipelineFailure> {
        self.sink.close().await.map_err(PipelineFailure::Sink)?;
        self.finished = true;
        Ok(())
    }

    async fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.sink.abort().await {
            debug!("sink abort failed: {e}");
        }
    }
}

enum Pulled {
    Chunk(io::Result<Bytes>),
    End,
    Cancelled,
}

/// How a pump run stopped without failing.
enum Stop {
    Drained,
    Cancelled,
}

/// One encrypt or decrypt run. Take a [`JobHandle`] before calling
/// [`start`](Self::start) to observe or cancel it.
///
/// Dropping a job that was never opened ends it without a report, or with
/// CANCELLED when a cancel was already requested.
pub struct StreamJob<R> {
    engine: Engine<R>,
    key: KeyOrPassword,
    compress: bool,
    shared: Arc<Shared>,
    opened: bool,
}

impl<R: RawEngine> StreamJob<R> {
    pub fn encrypt(
        engine: Engine<R>,
        key: KeyOrPassword,
        compress: bool,
        reporter: impl ProgressReporter + 'static,
    ) -> Self {
        Self::new(engine, Mode::Encrypt, key, compress, Arc::new(reporter))
    }

    pub fn decrypt(
        engine: Engine<R>,
        key: KeyOrPassword,
        reporter: impl ProgressReporter + 'static,
    ) -> Self {
        Self::new(engine, Mode::Decrypt, key, false, Arc::new(reporter))
    }

    pub fn new(
        engine: Engine<R>,
        mode: Mode,
        key: KeyOrPassword,
        compress: bool,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let (ended, _) = watch::channel(None);
        Self {
            engine,
            key,
            compress: compress && mode == Mode::Encrypt,
            shared: Arc::new(Shared {
                mode,
                reporter,
                cancel: CancellationToken::new(),
                processed: AtomicU64::new(0),
                report_lock: Mutex::new(None),
                ended,
            }),
            opened: false,
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// Open the engine transformer without moving any data.
    ///
    /// Fails with [`StreamError::Open`] before any progress event, and the
    /// job is marked ended.
    pub fn open(mut self) -> Result<OpenJob<R>, StreamError> {
        self.opened = true;
        let shared = Arc::clone(&self.shared);
        let mode = shared.mode;

        match self.engine.open(mode, &self.key, self.compress) {
            Ok(transformer) => {
                debug!(%mode, id = %transformer.id(), key = self.key.kind(), "stream job opened");
                Ok(OpenJob {
                    guard: EndGuard {
                        shared,
                        armed: true,
                    },
                    transformer,
                })
            }
            Err(e) => {
                warn!(%mode, "failed to open transformer: {e}");
                shared.end_silently(StreamStatus::Failed);
                Err(StreamError::Open(e))
            }
        }
    }

    /// Open the transformer and run the job to its end.
    ///
    /// Fails with [`StreamError::Open`] before any progress event when the
    /// engine will not open a transformer. Otherwise always returns an
    /// outcome; see [`OpenJob::run`].
    pub async fn start<S, K>(self, source: S, sink: &mut K) -> Result<JobOutcome, StreamError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
        K: ByteSink,
    {
        Ok(self.open()?.run(source, sink).await)
    }
}

impl<R> Drop for StreamJob<R> {
    fn drop(&mut self) {
        if !self.opened {
            self.shared.abandon();
        }
    }
}

/// A job whose transformer is open. Dropping it unrun ends the job CANCELLED.
pub struct OpenJob<R: RawEngine> {
    guard: EndGuard,
    transformer: Transformer<R>,
}

impl<R: RawEngine> OpenJob<R> {
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            shared: Arc::clone(&self.guard.shared),
        }
    }

    pub fn mode(&self) -> Mode {
        self.guard.shared.mode
    }

    /// Run the job to its end.
    ///
    /// A FAILED outcome carries the failure, which is also reported through
    /// the progress callback. The sink is closed on success and aborted on
    /// failure or cancellation. Partial output is left in place.
    pub async fn run<S, K>(self, mut source: S, sink: &mut K) -> JobOutcome
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
        K: ByteSink,
    {
        let OpenJob {
            mut guard,
            transformer,
        } = self;
        let shared = Arc::clone(&guard.shared);
        let mode = shared.mode;
        let mut outlet = Outlet::new(sink);

        let result = pump(&shared, transformer, &mut source, &mut outlet).await;
        let failure = match result {
            Ok(Stop::Drained) => None,
            Ok(Stop::Cancelled) => {
                outlet.abort().await;
                None
            }
            Err(failure) => {
                outlet.abort().await;
                Some(failure)
            }
        };

        guard.armed = false;
        let status = shared.finish(failure.is_some());
        let processed_size = shared.processed();
        match &failure {
            Some(e) => warn!(%mode, processed = processed_size, "stream job failed: {e}"),
            None => info!(%mode, processed = processed_size, %status, "stream job ended"),
        }

        JobOutcome {
            status,
            processed_size,
            failure,
        }
    }
}

type EngineCall<R> = (Transformer<R>, Result<Vec<u8>, EngineError>);

/// Run one transformer call on the blocking pool. The transformer travels
/// with the call and comes back with its result.
async fn off_runtime<R, F>(
    mut transformer: Transformer<R>,
    call: F,
) -> Result<EngineCall<R>, PipelineFailure>
where
    R: RawEngine,
    F: FnOnce(&mut Transformer<R>) -> Result<Vec<u8>, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = call(&mut transformer);
        (transformer, result)
    })
    .await
    .map_err(|e| PipelineFailure::Transform(EngineError::Engine(format!("engine call: {e}"))))
}

async fn pump<R, S, K>(
    shared: &Shared,
    mut transformer: Transformer<R>,
    source: &mut S,
    outlet: &mut Outlet<'_, K>,
) -> Result<Stop, PipelineFailure>
where
    R: RawEngine,
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    K: ByteSink,
{
    loop {
        let pulled = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Pulled::Cancelled,
            item = source.next() => match item {
                Some(chunk) => Pulled::Chunk(chunk),
                None => Pulled::End,
            },
        };

        let chunk = match pulled {
            Pulled::Cancelled => return Ok(Stop::Cancelled),
            Pulled::End => break,
            Pulled::Chunk(chunk) => chunk.map_err(PipelineFailure::Source)?,
        };
        let len = chunk.len() as u64;

        // A cancelled in-flight feed is abandoned; the blocking task drops
        // (and so closes) the transformer when the engine answers.
        let (returned, output) = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Ok(Stop::Cancelled),
            fed = off_runtime(transformer, move |t| t.feed(&chunk)) => fed?,
        };
        transformer = returned;
        let output = output.map_err(PipelineFailure::Transform)?;

        shared.processed.fetch_add(len, Ordering::AcqRel);
        if !output.is_empty() {
            outlet.push(output).await?;
            shared.report_processing();
        }
    }

    if shared.cancel.is_cancelled() {
        return Ok(Stop::Cancelled);
    }

    let (_, residual) = off_runtime(transformer, |t| t.close()).await?;
    let residual = residual.map_err(PipelineFailure::Transform)?;
    if !residual.is_empty() {
        outlet.push(residual).await?;
        shared.report_processing();
    }
    outlet.close().await?;
    Ok(Stop::Drained)
}
