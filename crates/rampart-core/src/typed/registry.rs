//! HandlerRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権
//!
//! 初期化時に組み立て（&mut）、実行時は `Arc<HandlerRegistry>` で共有して読むだけ。

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::HandlerKey;
use crate::error::RampartError;

/// (queue, name) -> handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 型付き Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RampartError> {
        self.register_dyn(T::handler_key(), Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    /// クロージャを登録: `registry.register_fn("enrichment", "lookup", |payload| async { .. })`
    pub fn register_fn<F, Fut>(
        &mut self,
        queue: impl Into<String>,
        name: impl Into<String>,
        f: F,
    ) -> Result<(), RampartError>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RampartError>> + Send + 'static,
    {
        self.register_dyn(HandlerKey::new(queue, name), Arc::new(FnHandler::new(f)))
    }

    pub fn register_dyn(
        &mut self,
        key: HandlerKey,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), RampartError> {
        if self.handlers.contains_key(&key) {
            return Err(RampartError::DuplicateHandler(key));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, key: &HandlerKey) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Sorted.
    pub fn registered_keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<HandlerKey> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Queues with at least one handler, sorted. One worker pool runs per queue.
    pub fn queues(&self) -> Vec<String> {
        self.handlers
            .keys()
            .map(|k| k.queue.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
