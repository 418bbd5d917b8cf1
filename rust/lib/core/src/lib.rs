pub mod config;
pub mod error;
pub mod types;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use types::{
    is_provisional, new_id, now_rfc3339, parse_timestamp, provisional_id, Clock, ManualClock,
    SystemClock,
};
