pub mod logging;
pub mod tasks;

pub use logging::{init_tracing, LogConfig};
pub use tasks::{TaskControl, TaskId, TaskRegistry};
