//! App - アプリケーション層
//!
//! このモジュールは、ports と resilience を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **Runtime**: enqueue / ステータス照会 / 完了通知
//! - **WorkerGroup**: キューごとのワーカープール（claim→handle→complete/fail）
//! - **SweeperLoop**: キャッシュとレート制限エントリの定期回収

pub mod builder;
pub mod runtime;
pub mod status;
pub mod sweeper_loop;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, AppHandle, BuildError};
pub use self::runtime::{Runtime, TaskDefaults};
pub use self::status::{QueueStatus, StatusReport};
pub use self::sweeper_loop::{SweepReport, SweeperHandle, SweeperLoop};
pub use self::worker_loop::WorkerGroup;
