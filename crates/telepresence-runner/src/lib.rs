//! Process supervision for a Telepresence session.
//!
//! The [`Runner`] owns every subprocess the session starts, pumps their
//! output into a single timestamped log, holds sudo credentials, and runs an
//! ordered cleanup stack on every exit path.

mod background;
mod cache;
mod command;
mod error;
mod logging;
mod output;
mod runner;

pub use background::{KillFn, KillFuture, LaunchOptions};
pub use cache::Cache;
pub use command::Cmd;
pub use error::RunnerError;
pub use logging::init_logging;
pub use output::Output;
pub use runner::{ExitReason, Platform, Runner, Ticker};
