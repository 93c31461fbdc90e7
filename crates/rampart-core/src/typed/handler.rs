//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> / FnHandler → DynHandler)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;

use super::task::Task;
use crate::error::RampartError;

/// Handler は Task を実行して結果を返す
///
/// # 使用例
/// ```ignore
/// struct LookupHandler;
///
/// #[async_trait]
/// impl Handler<LookupContact> for LookupHandler {
///     type Output = Contact;
///
///     async fn handle(&self, task: LookupContact) -> Result<Contact, RampartError> {
///         fetch_contact(&task.email).await
///     }
/// }
/// ```
///
/// `Err` は worker 側で捕捉され、リトライ / 失敗としてタスクに記録される。
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    /// タスクの `result` として保存される値
    type Output: Serialize + Send;

    async fn handle(&self, task: T) -> Result<Self::Output, RampartError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// payload / result ともに JSON 値で受け渡すので、
/// `HashMap<HandlerKey, Arc<dyn DynHandler>>` に格納できる。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: serde_json::Value)
    -> Result<serde_json::Value, RampartError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, RampartError> {
        // decode 失敗も通常の失敗としてリトライ対象にする
        let task: T = serde_json::from_value(payload)
            .map_err(|e| RampartError::compute(format!("payload decode: {e}")))?;
        let output = self.handler.handle(task).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Closure handler: `(payload) -> Result<result, RampartError>`.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, RampartError>> + Send + 'static,
{
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, RampartError> {
        (self.f)(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Double {
        value: i64,
    }

    impl Task for Double {
        const QUEUE: &'static str = "math";
        const NAME: &'static str = "double";
    }

    struct DoubleHandler;

    #[async_trait]
    impl Handler<Double> for DoubleHandler {
        type Output = i64;

        async fn handle(&self, task: Double) -> Result<i64, RampartError> {
            Ok(task.value * 2)
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_encodes() {
        let handler = TypedHandler::<Double, _>::new(DoubleHandler);
        let result = handler.handle_dyn(json!({ "value": 21 })).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn decode_failure_is_a_compute_error() {
        let handler = TypedHandler::<Double, _>::new(DoubleHandler);
        let err = handler.handle_dyn(json!({ "wrong": true })).await.unwrap_err();
        assert!(matches!(err, RampartError::Compute(ref m) if m.starts_with("payload decode")));
    }

    #[tokio::test]
    async fn fn_handler_passes_payload_through() {
        let handler = FnHandler::new(|payload: serde_json::Value| async move {
            Ok::<_, RampartError>(json!({ "echo": payload }))
        });
        let result = handler.handle_dyn(json!("hi")).await.unwrap();
        assert_eq!(result, json!({ "echo": "hi" }));
    }
}
