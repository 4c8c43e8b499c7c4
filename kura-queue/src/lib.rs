//! # Kura Queue
//!
//! Persistent command queue for the Kura media library server. Background
//! work such as hashing files, fetching AniDB metadata or refreshing a
//! collection is expressed as a [`Command`], enqueued through a
//! [`QueueHandle`] and executed by the [`QueueRuntime`] on a bounded worker
//! pool.
//!
//! ## Overview
//!
//! - **Commands**: self-describing units of work with a stable id, a
//!   parallel tag, a priority and a retry budget
//! - **Registry**: maps persisted class names back to concrete command types
//!   and holds the named preconditions commands may declare
//! - **Stores**: durable SQLite storage (`sqlite` feature) and an in-memory
//!   store, both behind the [`CommandStore`] trait
//! - **Dispatcher**: tag-aware admission, retry with backoff, precondition
//!   deferral, batch cancellation and graceful shutdown
//! - **Events**: a broadcast stream of lifecycle and progress events
//!
//! ## Feature Flags
//!
//! - `sqlite` (default): enables [`SqliteCommandStore`] and the bundled
//!   migrations
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kura_queue::{
//!     CommandRegistry, MemoryCommandStore, PutOptions, QueueRuntime,
//! };
//!
//! # async fn run() -> kura_queue::Result<()> {
//! let registry = CommandRegistry::builder().build()?;
//! let runtime = QueueRuntime::builder(
//!     Arc::new(MemoryCommandStore::default()),
//!     Arc::new(registry),
//! )
//! .build();
//! runtime.start().await?;
//!
//! let handle = runtime.handle();
//! println!("{} queued", handle.queued_count(&[]).await?);
//! # let _ = PutOptions::default();
//! runtime.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod backoff;
pub mod clock;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod precondition;
pub mod progress;
pub mod registry;
pub mod store;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{
    Command, CommandError, CommandId, CommandRequest, CommandResult, CommandState, CommandType,
    PrettyDescription, ScheduledCommand, WorkType, run_blocking,
};
pub use config::{QueueConfig, RetryConfig};
pub use dispatcher::{PutOptions, QueueHandle, QueueRuntime, QueueSnapshot, TickReport};
pub use error::{QueueError, RegistryError, Result};
pub use events::{ClearScope, QueueEvent, QueueEventBus, QueueEventPayload, RunId};
pub use precondition::{BanPrecondition, Precondition, PreconditionResult};
pub use progress::{CommandProgress, CommandStatus, ProgressReporter, ProgressSink};
pub use registry::{CommandRegistry, ReconstructError};
pub use store::{CommandStore, MemoryCommandStore, PutOutcome};

#[cfg(feature = "sqlite")]
pub use store::SqliteCommandStore;

/// Schema migrations for [`SqliteCommandStore`].
#[cfg(feature = "sqlite")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
