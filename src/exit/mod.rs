pub mod monitor;
pub mod supervisor;

pub use monitor::{run_monitor, ExitDecision, ExitPolicy, MonitorDeps};
pub use supervisor::{MonitorHandle, MonitorMap, Supervisor};
