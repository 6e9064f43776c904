//! Session-scoped "current job" slot.

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::Stream;
use xipher_engine::RawEngine;

use crate::pipeline::{JobHandle, JobOutcome, StreamError, StreamJob};
use crate::sink::ByteSink;

/// Holds at most one running job so a single cancel control has a target.
#[derive(Debug, Default)]
pub struct Session {
    current: Mutex<Option<JobHandle>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<JobHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `job` current. Fails with [`StreamError::Busy`] while another job
    /// has not ended.
    pub(crate) fn begin<R: RawEngine>(&self, job: &StreamJob<R>) -> Result<JobHandle, StreamError> {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|running| !running.is_ended()) {
            return Err(StreamError::Busy);
        }
        let handle = job.handle();
        *slot = Some(handle.clone());
        Ok(handle)
    }

    pub fn current(&self) -> Option<JobHandle> {
        self.slot().clone()
    }

    /// Cancel the current job. Returns `false` when nothing is running.
    pub fn cancel_current(&self) -> bool {
        match self.slot().as_ref() {
            Some(handle) if !handle.is_ended() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait until the current job, if any, has reported its terminal status.
    pub async fn wait_idle(&self) {
        let current = self.current();
        if let Some(handle) = current {
            handle.wait_ended().await;
        }
    }

    /// Run `job` as the current job and clear the slot afterwards.
    pub async fn run<R, S, K>(
        &self,
        job: StreamJob<R>,
        source: S,
        sink: &mut K,
    ) -> Result<JobOutcome, StreamError>
    where
        R: RawEngine,
        S: Stream<Item = io::Result<Bytes>> + Unpin,
        K: ByteSink,
    {
        let handle = self.begin(&job)?;
        let result = job.start(source, sink).await;
        self.release(&handle);
        result
    }

    pub(crate) fn release(&self, handle: &JobHandle) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|current| current.same_job(handle)) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::sink::MemorySink;
    use crate::status::StreamStatus;
    use futures::stream;
    use xipher_engine::mock::MockEngine;
    use xipher_engine::{Engine, KeyOrPassword};

    fn job(engine: &Engine<MockEngine>) -> StreamJob<MockEngine> {
        StreamJob::encrypt(
            engine.clone(),
            KeyOrPassword::classify("XSK_S"),
            true,
            NoProgress,
        )
    }

    #[test]
    fn test_second_job_is_busy() {
        let engine = Engine::new(MockEngine::new());
        let session = Session::new();
        let first = job(&engine);
        session.begin(&first).unwrap();
        assert!(matches!(session.begin(&job(&engine)), Err(StreamError::Busy)));
        assert!(session.cancel_current());
        assert!(session.current().unwrap().is_cancelled());
    }

    #[test]
    fn test_dropped_job_frees_slot() {
        let engine = Engine::new(MockEngine::new());
        let session = Session::new();
        let first = job(&engine);
        session.begin(&first).unwrap();
        drop(first);

        assert!(!session.cancel_current());
        let second = job(&engine);
        assert!(session.begin(&second).is_ok());
    }

    #[tokio::test]
    async fn test_run_clears_slot() {
        let engine = Engine::new(MockEngine::new());
        let session = Session::new();
        let mut sink = MemorySink::new();
        let source = stream::iter(vec![Ok(Bytes::from_static(b"hello"))]);

        let outcome = session.run(job(&engine), source, &mut sink).await.unwrap();
        assert_eq!(outcome.status, StreamStatus::Completed);
        assert!(session.current().is_none());
        assert!(!session.cancel_current());
        session.wait_idle().await;
    }

    #[tokio::test]
    async fn test_failed_open_frees_slot() {
        let engine = Engine::new(MockEngine::new().fail_open("bad key"));
        let session = Session::new();
        let mut sink = MemorySink::new();
        let source = stream::iter(Vec::<io::Result<Bytes>>::new());

        let err = session.run(job(&engine), source, &mut sink).await.unwrap_err();
        assert!(matches!(err, StreamError::Open(_)));
        assert!(session.current().is_none());
    }
}
