//! Lumen Core
//!
//! Shared infrastructure for the Lumen renderer: logging setup, puffin
//! profiling helpers and the background task pool used for work that must
//! never block the render thread.

pub mod logging;
pub mod profiling;
pub mod task_pool;

pub use task_pool::{Task, TaskPool};
