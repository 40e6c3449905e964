//! 同步引擎
//!
//! - `SyncCoordinator`: 推送、队列 drain、恢复、删除、强制覆盖
//! - `ConflictDetector`: 打开与停留期间的冲突探测
//! - `ConflictResolver`: 取远端 / 保留本地
//! - `Debouncer`: 编辑防抖
//! - `RetryPolicy`: 分类重试与指数退避

pub mod conflict;
pub mod coordinator;
pub mod debounce;
pub mod resolution;
pub mod retry_policy;

pub use conflict::{ConflictCheck, ConflictDetector, ConflictWatch};
pub use coordinator::{DrainReport, RecoveryReport, SyncCoordinator, SyncDeps, SyncSummary};
pub use debounce::{DebouncedEntity, Debouncer};
pub use resolution::{ConflictResolver, Resolution};
pub use retry_policy::RetryPolicy;
