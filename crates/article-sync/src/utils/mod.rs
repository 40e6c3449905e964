//! 通用工具：时钟与 ID 生成

pub mod id;
pub mod time;

pub use id::{generate_device_id, ClientIdGenerator, IdGenerator, IdWatermark};
pub use time::{Clock, ManualClock, SystemClock};
