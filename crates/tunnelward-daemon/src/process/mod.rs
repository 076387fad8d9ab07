//! Client process lifecycle management.

pub mod output;
pub mod supervisor;
pub mod types;

pub use output::{OUTPUT_TAIL_LINES, OutputTail, extract_url};
pub use supervisor::{DEFAULT_TERMINATE_TIMEOUT, ProcessSupervisor};
pub use types::{ExitReason, ProcessState, ProcessStatus, TunnelUrlInfo};
