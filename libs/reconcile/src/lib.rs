//! Reconciliation loop primitives.
//!
//! This library provides the resource-agnostic building blocks used to
//! converge a remote resource toward a desired state:
//!
//! - **Poller** ([`poll`]): turns an asynchronous remote state transition into
//!   a synchronous, deadline-bounded, cancellable wait.
//! - **Backoff** ([`backoff`]): exponential delays with jitter for retrying
//!   transient read failures inside a wait.
//! - **Cancellation** ([`cancel`]): an externally controlled signal that aborts
//!   long waits without issuing further remote calls.
//! - **Dependencies** ([`deps`]): ordering of independent resources so callers
//!   can reconcile them in topological waves.
//! - **Spec hashing** ([`hash`]): deterministic fingerprints of desired state.
//!
//! # Invariants
//!
//! - A wait never extends its deadline, regardless of how many retries occur
//! - Decisions are deterministic given the same inputs
//! - Nothing here issues mutations; callers own every remote side effect

pub mod backoff;
pub mod cancel;
pub mod deps;
pub mod hash;
pub mod poll;

use std::time::Duration;

pub use backoff::BackoffPolicy;
pub use cancel::{cancellation, CancelHandle, CancelSignal};
pub use deps::{unmet_dependencies, CycleError, DependencyGraph};
pub use hash::SpecHash;
pub use poll::{Poller, Retryable, WaitError, WaitOutcome};

/// Default interval between successive reads while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default base delay for transient-failure backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default ceiling for transient-failure backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
