//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: プロセス内のタスクストア（開発・テスト・単一プロセス運用向け）
//!
//! 外部 DB を使う実装は別クレートで TaskStore を実装する想定。

pub mod inmem_task_store;

pub use self::inmem_task_store::InMemoryTaskStore;
