//! Persistence: relational store, shared counters and the task queue.

pub mod store {
    pub use crate::store::*;
}

pub mod db {
    pub use crate::db::*;
}

pub mod db_storage {
    pub use crate::db_storage::*;
}

pub mod redis_backend {
    pub use crate::redis_backend::*;
}

pub mod task_queue {
    pub use crate::task_queue::*;
}
