pub mod config;
pub mod error;
pub mod ids;

pub use config::{load_dotenv, parse_interval, OverlapPolicy, SchedulerConfig};
pub use error::*;
pub use ids::{Owner, TaskId};
