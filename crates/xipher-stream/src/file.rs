//! File-to-file stream jobs.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio_util::io::ReaderStream;
use tracing::debug;
use xipher_core::types::{decrypted_path, encrypted_path};
use xipher_core::Mode;
use xipher_engine::{Engine, KeyOrPassword, RawEngine};

use crate::pipeline::{JobOutcome, StreamError, StreamJob};
use crate::progress::ProgressReporter;
use crate::session::Session;
use crate::sink::WriterSink;

/// Default read size for file sources.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Input and output paths for one file job.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    pub input: PathBuf,
    pub output: PathBuf,
    pub chunk_size: usize,
    pub overwrite: bool,
}

impl FileTransfer {
    /// `name.ext` → `name.ext.xipher`
    pub fn for_encrypt(input: impl Into<PathBuf>) -> Self {
        let input = input.into();
        let output = encrypted_path(&input);
        Self::new(input, output)
    }

    /// `name.ext.xipher` → `name.ext`
    pub fn for_decrypt(input: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let input = input.into();
        let output = decrypted_path(&input).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a .xipher file", input.display()),
            )
        })?;
        Ok(Self::new(input, output))
    }

    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            overwrite: false,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    /// Size of the input in bytes, for progress totals.
    pub async fn input_len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.input).await?.len())
    }

    /// Run `job` from the input file into the output file.
    ///
    /// The output is created fresh, or replaced with `overwrite`. An existing
    /// output is truncated only after the engine opened its transformer, and
    /// a file created for a job the engine refused is removed again. A FAILED
    /// or CANCELLED job leaves its partial output for the caller to deal with.
    pub async fn run<R: RawEngine>(&self, job: StreamJob<R>) -> Result<JobOutcome, StreamError> {
        self.drive(None, job).await
    }

    /// Like [`run`](Self::run), as the current job of `session`.
    pub async fn run_in<R: RawEngine>(
        &self,
        session: &Session,
        job: StreamJob<R>,
    ) -> Result<JobOutcome, StreamError> {
        self.drive(Some(session), job).await
    }

    async fn drive<R: RawEngine>(
        &self,
        session: Option<&Session>,
        job: StreamJob<R>,
    ) -> Result<JobOutcome, StreamError> {
        if self.input == self.output {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "input and output are the same file",
            )
            .into());
        }

        let claimed = match session {
            Some(session) => Some((session, session.begin(&job)?)),
            None => None,
        };
        let result = self.transfer(job).await;
        if let Some((session, handle)) = claimed {
            session.release(&handle);
        }
        result
    }

    async fn transfer<R: RawEngine>(&self, job: StreamJob<R>) -> Result<JobOutcome, StreamError> {
        let input = File::open(&self.input).await?;
        let (output, created) = self.create_output().await?;

        let job = match job.open() {
            Ok(job) => job,
            Err(e) => {
                drop(output);
                if created {
                    if let Err(e) = fs::remove_file(&self.output).await {
                        debug!("could not remove unused output: {e}");
                    }
                }
                return Err(e);
            }
        };
        if !created {
            output.set_len(0).await?;
        }
        debug!(
            mode = %job.mode(),
            input = %self.input.display(),
            output = %self.output.display(),
            chunk_size = self.chunk_size,
            "file job"
        );

        let source = ReaderStream::with_capacity(input, self.chunk_size);
        let mut sink = WriterSink::new(output);
        Ok(job.run(source, &mut sink).await)
    }

    /// Open the output for writing without truncating it. The flag is true
    /// when the file did not exist before.
    async fn create_output(&self) -> io::Result<(File, bool)> {
        let existed = self.overwrite && fs::try_exists(&self.output).await?;
        let mut options = OpenOptions::new();
        options.write(true);
        if self.overwrite {
            options.create(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(&self.output).await.map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                io::Error::new(
                    e.kind(),
                    format!("{} already exists", self.output.display()),
                )
            } else {
                e
            }
        })?;
        Ok((file, !existed))
    }
}

/// Encrypt `input` into `input.xipher`.
pub async fn encrypt_file<R: RawEngine>(
    engine: Engine<R>,
    key: KeyOrPassword,
    compress: bool,
    input: &Path,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<JobOutcome, StreamError> {
    let job = StreamJob::new(engine, Mode::Encrypt, key, compress, reporter);
    FileTransfer::for_encrypt(input).run(job).await
}

/// Decrypt `input.xipher` into `input`.
pub async fn decrypt_file<R: RawEngine>(
    engine: Engine<R>,
    key: KeyOrPassword,
    input: &Path,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<JobOutcome, StreamError> {
    let transfer = FileTransfer::for_decrypt(input)?;
    let job = StreamJob::new(engine, Mode::Decrypt, key, false, reporter);
    transfer.run(job).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{NoProgress, ProgressLog};
    use crate::status::StreamStatus;
    use xipher_engine::mock::MockEngine;

    fn key() -> KeyOrPassword {
        KeyOrPassword::classify("correct horse")
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("report.pdf");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 256) as u8).collect();
        std::fs::write(&plain, &data).unwrap();

        let engine = Engine::new(MockEngine::new());
        let log = Arc::new(ProgressLog::new());
        let outcome = encrypt_file(engine.clone(), key(), true, &plain, log.clone())
            .await
            .unwrap();
        assert_eq!(outcome.status, StreamStatus::Completed);
        assert_eq!(outcome.processed_size, data.len() as u64);
        assert_eq!(log.last(), Some((data.len() as u64, StreamStatus::Completed)));

        let sealed = tmp.path().join("report.pdf.xipher");
        assert!(sealed.exists());
        std::fs::remove_file(&plain).unwrap();

        let outcome = decrypt_file(engine, key(), &sealed, Arc::new(NoProgress))
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(std::fs::read(&plain).unwrap(), data);
    }

    #[tokio::test]
    async fn test_existing_output_is_not_clobbered() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("a.txt");
        std::fs::write(&plain, b"new").unwrap();
        std::fs::write(tmp.path().join("a.txt.xipher"), b"keep me").unwrap();

        let engine = Engine::new(MockEngine::new());
        let job = StreamJob::encrypt(engine.clone(), key(), true, NoProgress);
        let err = FileTransfer::for_encrypt(&plain).run(job).await.unwrap_err();
        assert!(matches!(err, StreamError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
        assert_eq!(
            std::fs::read(tmp.path().join("a.txt.xipher")).unwrap(),
            b"keep me"
        );

        let job = StreamJob::encrypt(engine, key(), true, NoProgress);
        let outcome = FileTransfer::for_encrypt(&plain)
            .with_overwrite(true)
            .run(job)
            .await
            .unwrap();
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn test_open_failure_removes_output() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("a.txt");
        std::fs::write(&plain, b"data").unwrap();

        let engine = Engine::new(MockEngine::new().fail_open("bad key"));
        let job = StreamJob::encrypt(engine, key(), true, NoProgress);
        let err = FileTransfer::for_encrypt(&plain).run(job).await.unwrap_err();
        assert!(matches!(err, StreamError::Open(_)));
        assert!(!tmp.path().join("a.txt.xipher").exists());
    }

    #[tokio::test]
    async fn test_refused_overwrite_keeps_existing_output() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("a.txt");
        let sealed = tmp.path().join("a.txt.xipher");
        std::fs::write(&plain, b"data").unwrap();
        std::fs::write(&sealed, b"earlier ciphertext").unwrap();

        let engine = Engine::new(MockEngine::new().fail_open("bad key"));
        let job = StreamJob::encrypt(engine, key(), true, NoProgress);
        let err = FileTransfer::for_encrypt(&plain)
            .with_overwrite(true)
            .run(job)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Open(_)));
        assert_eq!(std::fs::read(&sealed).unwrap(), b"earlier ciphertext");
    }

    #[tokio::test]
    async fn test_overwrite_replaces_longer_output() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("a.txt");
        let sealed = tmp.path().join("a.txt.xipher");
        std::fs::write(&plain, b"short").unwrap();
        std::fs::write(&sealed, vec![0xEE; 4096]).unwrap();

        let engine = Engine::new(MockEngine::new());
        let job = StreamJob::encrypt(engine.clone(), key(), false, NoProgress);
        let outcome = FileTransfer::for_encrypt(&plain)
            .with_overwrite(true)
            .run(job)
            .await
            .unwrap();
        assert!(outcome.is_completed());
        std::fs::remove_file(&plain).unwrap();

        decrypt_file(engine, key(), &sealed, Arc::new(NoProgress))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&plain).unwrap(), b"short");
    }

    #[tokio::test]
    async fn test_busy_session_leaves_output_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("a.txt");
        std::fs::write(&plain, b"data").unwrap();

        let engine = Engine::new(MockEngine::new());
        let session = Session::new();
        let running = StreamJob::encrypt(engine.clone(), key(), true, NoProgress);
        session.begin(&running).unwrap();

        let job = StreamJob::encrypt(engine, key(), true, NoProgress);
        let err = FileTransfer::for_encrypt(&plain)
            .run_in(&session, job)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Busy));
        assert!(!tmp.path().join("a.txt.xipher").exists());
    }

    #[test]
    fn test_for_decrypt_requires_extension() {
        assert!(FileTransfer::for_decrypt("notes.txt").is_err());
        let transfer = FileTransfer::for_decrypt("notes.txt.xipher").unwrap();
        assert_eq!(transfer.output, PathBuf::from("notes.txt"));
    }
}
