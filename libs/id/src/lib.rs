//! # cirrus-id
//!
//! Identifier types used across the cirrus reconciler.
//!
//! ## Kinds of identifiers
//!
//! - **Remote identifiers** are issued by the cluster-management service
//!   (e.g. `j-2AXXXXXXGAPLF`). They are opaque: we never generate them and
//!   never interpret their structure beyond basic well-formedness.
//! - **Local identifiers** are generated by cirrus itself to correlate log
//!   lines and failures belonging to one reconciliation pass. They use a
//!   prefixed ULID format: `{prefix}_{ulid}`, e.g.
//!   `rec_01HV4Z2WQXKJNM8GPQY6VBKC3D`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
