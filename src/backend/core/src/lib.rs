//! # Conflux Core
//!
//! An aggregate-completion engine: correlates streams of asynchronous,
//! out-of-order partial updates against parent aggregates and reports
//! completion or deadline expiry.
//!
//! ## Architecture
//!
//! - **AggregateStore**: registry routing child updates to aggregates and
//!   emitting lifecycle events
//! - **Aggregate**: one correlation unit with a fixed key set and an
//!   optional deadline
//! - **PendingBuffer**: TTL-bounded holding area for updates that arrive
//!   before their parent aggregate exists
//! - **Telemetry**: structured logging infrastructure
//!
//! Transport adapters (network/queue/socket glue) live outside this crate:
//! they feed the three inbound operations (`create_aggregate`,
//! `submit_update`, `remove_aggregate`) and consume the outbound
//! [`StoreEvent`](events::StoreEvent) stream.

pub mod config;
pub mod error;
pub mod events;
pub mod store;
pub mod telemetry;

pub use error::{ConfluxError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, StoreConfig};
    pub use crate::error::{ConfluxError, ErrorCode, ErrorContext, ErrorSeverity, Result};
    pub use crate::events::StoreEvent;
    pub use crate::store::{Aggregate, AggregateId, AggregateState, AggregateStore, PendingUpdate};
    pub use crate::telemetry::{init_logging, LogFormat, LoggingConfig};
}
