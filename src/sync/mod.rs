//! Sync queue and reconciliation.
//!
//! Mutations are appended to a durable queue and delivered to the server in
//! enqueue order whenever a drain runs. An entry leaves the queue only when the
//! server acknowledges it; every other outcome leaves it queued for the next
//! drain. Append endpoints are not naturally idempotent, so each entry carries
//! a client-generated idempotency key.

pub mod queue;
pub mod reconciler;
pub mod transport;

pub use queue::{Mutation, RecordRef, SyncQueue, SyncQueueEntry};
pub use reconciler::{AckHook, DrainOutcome, DrainReport, Reconciler};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport};
