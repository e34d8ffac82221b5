//! In-process event log and job queue. A real deployment would back these
//! with Kafka/SQS; here they are `parking_lot`-guarded in-memory structures
//! behind the same traits, following the `RwLock<HashMap<...>>`-over-shared-
//! state idiom the broker's book stores use for their order books.

pub mod job_queue;
pub mod signal_log;

pub use job_queue::{InMemoryJobQueue, Job, JobQueue};
pub use signal_log::{EventLog, InMemoryEventLog};
