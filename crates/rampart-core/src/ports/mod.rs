//! Ports - 抽象化レイヤー
//!
//! 時刻・ID 生成・タスク永続化を trait で切り出し、実装を差し替え可能にする。

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{FailOutcome, QueueCounts, TaskLease, TaskStore};
