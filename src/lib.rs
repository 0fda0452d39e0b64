pub mod aggregate;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod event;
pub mod handle;
pub mod queue;
pub mod raw;
pub mod scan;
pub mod track;

pub use config::Config;
pub use data::{Process, ProcessId};
pub use error::{Error, Result};
pub use event::{Event, Kind, Kinds};
pub use handle::{Handle, Stats};
pub use track::Tracker;
