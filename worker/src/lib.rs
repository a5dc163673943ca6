//! Parallel slab download engine for the tessera storage client.
//!
//! Given an object description and a list of usable host contracts, the
//! engine fetches enough encoded shards from hosts in parallel to
//! reconstruct the object and streams the decoded bytes to a caller-supplied
//! sink, with bounded concurrency, speculative re-requests (overdrive),
//! per-host scheduling and statistics-driven host selection.
//!
//! # Architecture
//!
//! - [`download::DownloadManager`] owns one [`downloader`] per host and
//!   sequences slab downloads across an object, at most three in flight.
//! - Each slab download dispatches `min_shards` primary sector requests,
//!   hedges slow hosts with overdrive requests, and completes as soon as
//!   enough shards arrived.
//! - Per-host request queues execute in FIFO order, at most three sectors
//!   concurrently per host.
//! - [`pricetable::PriceTables`] caches each host's price table with a
//!   single-flight refresh; [`host::SectorHost`] consults it before every
//!   paid read.
//!
//! The wire transport, the contract and object stores, and the payment
//! machinery are collaborator capabilities passed in by the surrounding
//! service; see the traits in [`host`] and [`pricetable`].

pub mod download;
pub mod downloader;
pub mod error;
pub mod host;
pub mod pricetable;
mod stats;

pub use download::{DownloadConfig, DownloadManager, DownloadManagerStats};
pub use downloader::DownloaderStats;
pub use error::{Error, HostError, HostErrorSet, Result};
pub use host::{
    Host, HostProvider, Payment, PaymentPolicy, SectorHost, SectorHostProvider, SectorTransport,
};
pub use pricetable::{
    HostPriceTable, PriceTablePaymentFn, PriceTableTransport, PriceTables,
    PRICE_TABLE_VALIDITY_LEEWAY,
};
