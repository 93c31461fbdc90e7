//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const QUEUE`, `const NAME`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::HandlerKey;

/// Task は (queue, name) と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct LookupContact {
///     email: String,
/// }
///
/// impl Task for LookupContact {
///     const QUEUE: &'static str = "enrichment";
///     const NAME: &'static str = "lookup_contact";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: enqueue 時に payload へ変換するため
/// - `DeserializeOwned`: worker 側で payload から復元するため
/// - `Send + Sync + 'static`: worker タスクへ move するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 投入先の queue
    const QUEUE: &'static str;

    /// handler を識別する名前（queue 内で一意）
    const NAME: &'static str;

    fn handler_key() -> HandlerKey {
        HandlerKey::new(Self::QUEUE, Self::NAME)
    }
}
