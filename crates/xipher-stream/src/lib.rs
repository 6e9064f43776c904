//! xipher-stream: drive byte streams through the engine's chunked transformer
//!
//! A [`StreamJob`] pulls chunks from a source, feeds each one to an engine
//! transformer and pushes the output into a [`ByteSink`]. Progress is reported
//! in source bytes consumed so percentages work the same for both directions.
//!
//! ```text
//! PROCESSING ─┬─► COMPLETED
//!             ├─► FAILED
//!             └─► CANCELLING ─► CANCELLED
//! ```
//!
//! Cancellation is cooperative: [`JobHandle::cancel`] reports CANCELLING at
//! once, the pipeline stops at the next chunk boundary and aborts the sink.
//! Cancellation is always honored before the final flush. Engine calls run on
//! tokio's blocking pool.

pub mod file;
pub mod pipeline;
pub mod progress;
pub mod session;
pub mod sink;
pub mod status;

pub use file::{decrypt_file, encrypt_file, FileTransfer};
pub use pipeline::{JobHandle, JobOutcome, OpenJob, PipelineFailure, StreamError, StreamJob};
pub use progress::{NoProgress, ProgressLog, ProgressReporter};
pub use session::Session;
pub use sink::{ByteSink, MemorySink, WriterSink};
pub use status::StreamStatus;
