//! Domain model: ids, task records, state machine, backoff, events.

pub mod backoff;
pub mod events;
pub mod ids;
pub mod state;
pub mod task;

pub use backoff::BackoffPolicy;
pub use events::DomainEvent;
pub use ids::TaskId;
pub use state::TaskState;
pub use task::{DEFAULT_MAX_ATTEMPTS, EnqueueOptions, HandlerKey, TaskRecord};
