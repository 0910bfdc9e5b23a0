#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod coordinator;
mod error;
mod jobs;
mod lease;
mod lock;
mod quarantine;
mod range;
pub mod record;
mod schedule;
mod store;
mod time;

pub use crate::cache::*;
pub use crate::config::*;
pub use crate::coordinator::AllocationCoordinator;
pub use crate::error::*;
pub use crate::jobs::*;
pub use crate::lease::*;
pub use crate::lock::*;
pub use crate::quarantine::*;
pub use crate::range::*;
pub use crate::record::{ChildPool, DEFAULT_QUARANTINE_DELAY_SECS, GlobalPool};
pub use crate::schedule::*;
pub use crate::store::*;
pub use crate::time::*;
