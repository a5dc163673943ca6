//! Error types for the download engine.
//!
//! Sector errors fall into two classes that drive host selection: errors the
//! host is not to blame for (an empty ephemeral account, an expired price
//! table, a sector the host was never asked to store) are recorded but do
//! not penalize the host; everything else poisons the host's latency
//! estimate until it succeeds again.

use common::object::CodecError;
use common::PublicKey;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine. `Clone` so that the waiters of a
/// single-flight price-table refresh can all observe the leader's failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The download was cancelled by the caller.
    #[error("download was cancelled")]
    Cancelled,

    /// The manager was stopped.
    #[error("manager was stopped")]
    Stopped,

    /// A slab has fewer reachable hosts than its erasure threshold.
    #[error("not enough hosts available to download the slab: {available}/{required}")]
    NotEnoughHosts { available: usize, required: usize },

    /// No host is left to dispatch a sector request to.
    #[error("no hosts available")]
    NoHostsAvailable,

    /// A request was routed to a host without a running downloader.
    #[error("no downloader for host {0}")]
    NoDownloader(PublicKey),

    /// The ephemeral account cannot cover the read. Host-blameless.
    #[error("ephemeral account balance is insufficient")]
    InsufficientBalance,

    /// The host rejected our price table as expired. Host-blameless.
    #[error("host price table is expired")]
    PriceTableExpired,

    /// The host does not know the referenced price table. Host-blameless.
    #[error("host price table not found")]
    PriceTableNotFound,

    /// The host does not store the requested sector. Host-blameless.
    #[error("sector not found on host")]
    SectorNotFound,

    /// The host or an intermediary rejected the payment.
    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    /// Transport-level failure talking to the host.
    #[error("transport error: {0}")]
    Transport(String),

    /// A price-table refresh task died before publishing a result.
    #[error("price table refresh was interrupted")]
    RefreshInterrupted,

    /// Decrypt/recover/reconstruct failure. Fatal for the download.
    #[error("codec error: {0}")]
    Codec(String),

    /// The slab could not be completed; carries every per-host error.
    #[error("failed to download slab: completed={completed}, inflight={inflight}, launched={launched}, downloaders={downloaders}, errors={errs}")]
    SlabDownloadFailed {
        completed: usize,
        inflight: u64,
        launched: u64,
        downloaders: usize,
        errs: HostErrorSet,
    },
}

impl Error {
    /// Errors that must not penalize the host's latency estimate or its
    /// failure streak.
    pub fn is_host_blameless(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance
                | Error::PriceTableExpired
                | Error::PriceTableNotFound
                | Error::SectorNotFound
        )
    }

    /// Cancellation kinds: the request was abandoned on our side.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Stopped)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e.to_string())
    }
}

/// One host's contribution to a failed slab download.
#[derive(Debug, Clone)]
pub struct HostError {
    pub host_key: PublicKey,
    pub error: Error,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.host_key, self.error)
    }
}

/// Ordered aggregation of per-host errors. No deduplication: a host that
/// failed twice appears twice.
#[derive(Debug, Clone, Default)]
pub struct HostErrorSet(pub Vec<HostError>);

impl HostErrorSet {
    pub fn push(&mut self, host_key: PublicKey, error: Error) {
        self.0.push(HostError { host_key, error });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for HostErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} host(s) failed", self.0.len())?;
        for he in &self.0 {
            write!(f, "\n  {}", he)?;
        }
        Ok(())
    }
}
