//! Typed - 型付き Task API
//!
//! (queue, name) の typo を型で排除し、Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure
//!
//! 型を定義するほどでもない handler は `register_fn` でクロージャとして登録できる。

pub mod handler;
pub mod registry;
pub mod task;

// 主要な trait/型 を再エクスポート
pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler};
pub use self::registry::HandlerRegistry;
pub use self::task::Task;
