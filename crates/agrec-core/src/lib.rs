pub mod config;
pub mod coordinator;
pub mod error;
pub mod io;
pub mod keys;
pub mod process;
pub mod program;
pub mod schedule;
pub mod source;
pub mod store;

pub use error::{AgrecError, Result};
pub use program::{ClockTime, Program};
pub use schedule::Schedule;
