// Domain-layer modules and shared errors/models
pub mod circuit_breaker {
    pub use crate::circuit_breaker::*;
}

pub mod rate_limiter {
    pub use crate::rate_limiter::*;
}

pub mod campaign_lifecycle {
    pub use crate::campaign_lifecycle::*;
}

pub mod job_lifecycle {
    pub use crate::job_lifecycle::*;
}

pub mod campaign_event_handler {
    pub use crate::campaign_event_handler::*;
}

pub mod queue_manager {
    pub use crate::queue_manager::*;
}

pub mod campaign_service {
    pub use crate::campaign_service::*;
}

pub mod worker {
    pub use crate::worker::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
