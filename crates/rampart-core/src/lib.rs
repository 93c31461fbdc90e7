//! rampart-core
//!
//! 外部依存を呼び出すバックグラウンド処理のための耐障害レイヤー。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, backoff, events）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, TaskStore）
//! - **impls**: 実装（InMemoryTaskStore）
//! - **resilience**: TtlCache / RateLimiter / CircuitBreakers
//! - **typed**: 型付き Task API（Task trait, Handler trait, HandlerRegistry）
//! - **app**: アプリケーションロジック（builder, runtime, worker_loop, sweeper_loop, status）
//! - **config**: 設定ファイル + 環境変数
//! - **observability**: tracing の初期化
//! - **error**: エラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod resilience;
pub mod typed;

pub use crate::app::{App, AppBuilder, AppHandle, Runtime, WorkerGroup};
pub use crate::config::Settings;
pub use crate::domain::{BackoffPolicy, EnqueueOptions, TaskId, TaskRecord, TaskState};
pub use crate::error::{CircuitOpenError, RampartError, RateLimitExceeded};
pub use crate::resilience::{CircuitBreakers, RateLimiter, Resilience, TtlCache};
pub use crate::typed::{Handler, Task};
