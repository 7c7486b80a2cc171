//! `agrec-scheduler` turns a weekly timetable into supervised recorder
//! runs.
//!
//! ```text
//! TimetableSource ─▶ TimetableUpdater ──on_update──▶ RecorderInvoker ─▶ recorder process
//!                                                          │
//!                                                    on_complete
//!                                                          ▼
//!                                                   CleanupInvoker ─▶ cleanup process
//! ```
//!
//! Each worker owns one thread. The [`Scheduler`] wires them together and
//! maps [`ControlEvent`]s (usually from [`signals::install`]) onto graceful
//! or immediate shutdown.

pub mod cleanup;
pub mod error;
pub mod recorder;
pub mod scheduler;
pub mod signals;
pub mod timers;
pub mod updater;
pub mod worker;

pub use error::{Result, SchedulerError};
pub use scheduler::{Exit, Respawn, Scheduler, SchedulerOptions};
pub use signals::ControlEvent;
pub use worker::{ShutdownMode, Worker, WorkerState};
