//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - WebFinger discovery
//! - Internal content-service API
//! - Metrics (Prometheus)

mod activitypub;
mod dto;
mod extract;
mod internal;
pub mod metrics;
mod wellknown;

pub use dto::*;

pub use activitypub::activitypub_router;
pub use internal::internal_router;
pub use metrics::{metrics_router, track_http_metrics};
pub use wellknown::wellknown_router;
