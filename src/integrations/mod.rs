//! External service integrations.

pub use crate::errors::IntegrationError;

pub mod services {
    pub use crate::services::*;
}

pub mod service_guard {
    pub use crate::service_guard::*;
}

pub mod enrichment {
    pub use crate::enrichment::*;
}
