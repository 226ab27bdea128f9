pub mod clock;
pub mod config;
pub mod error;
pub mod management;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use management::ManagementService;
pub use node::SchedulerNode;
