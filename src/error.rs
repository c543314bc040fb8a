//! Error types for the bridge.
//!
//! Internal plumbing and top-level orchestration use [`anyhow::Result`] with
//! `.context(...)`, the way a CLI wired around `anyhow` normally does. This
//! module exists for the couple of startup failures that are fatal by
//! definition (§7) and benefit from a named variant rather than an ad hoc
//! `anyhow!(...)` string — everything else (transient serial I/O, broker
//! I/O, malformed command envelopes) is handled inline by logging and
//! state transitions, never by raising one of these.

use thiserror::Error;

/// Fatal startup failures the process aborts on.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("mandatory identity field missing: {0}")]
    MandatoryIdentityMissing(&'static str),

    #[error("no broker could be reached")]
    NoBrokerConnected,
}
