//! Per-host price-table cache with single-flight refresh.
//!
//! Every paid RPC needs a price table that the host still considers valid.
//! Tables are short-lived, so the cache treats an entry as pre-expired
//! [`PRICE_TABLE_VALIDITY_LEEWAY`] before its actual expiry and refreshes it
//! lazily. Concurrent refreshes for the same host collapse into one
//! transport round-trip: the first caller spawns the refresh, everyone else
//! awaits the same result. A waiter that gives up does not cancel the
//! refresh; the result is still cached for the next read.

use crate::error::{Error, Result};
use crate::host::Payment;
use async_trait::async_trait;
use common::{Currency, PublicKey};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// How long before its actual expiry a cached price table is already
/// considered invalid.
pub const PRICE_TABLE_VALIDITY_LEEWAY: Duration = Duration::from_secs(30);

/// A host's current price list. Required before any paid RPC and valid for
/// `validity` from the moment the host issued it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPriceTable {
    pub uid: u64,
    pub validity: Duration,
    pub update_price_table_cost: Currency,
    pub download_sector_cost: Currency,
}

/// Builds the payment for a price-table refresh once the host has revealed
/// its cost.
pub type PriceTablePaymentFn = Arc<dyn Fn(&HostPriceTable) -> Result<Payment> + Send + Sync>;

/// Wire-level price-table RPC. Implemented by the transport layer; the cache
/// only decides when to call it.
#[async_trait]
pub trait PriceTableTransport: Send + Sync {
    async fn fetch_price_table(
        &self,
        host_addr: &str,
        host_key: PublicKey,
        pay: PriceTablePaymentFn,
    ) -> Result<HostPriceTable>;
}

type RefreshResult = Option<Result<HostPriceTable>>;

struct EntryState {
    pt: Option<HostPriceTable>,
    expiry: Instant,
    ongoing: Option<watch::Receiver<RefreshResult>>,
}

struct PriceTableEntry {
    inner: parking_lot::Mutex<EntryState>,
}

/// The per-host price-table cache. Entries are created lazily and never
/// evicted while the process runs.
pub struct PriceTables {
    transport: Arc<dyn PriceTableTransport>,
    tables: DashMap<PublicKey, Arc<PriceTableEntry>>,
}

impl PriceTables {
    pub fn new(transport: Arc<dyn PriceTableTransport>) -> Self {
        Self {
            transport,
            tables: DashMap::new(),
        }
    }

    fn entry(&self, host_key: PublicKey) -> Arc<PriceTableEntry> {
        self.tables
            .entry(host_key)
            .or_insert_with(|| {
                Arc::new(PriceTableEntry {
                    inner: parking_lot::Mutex::new(EntryState {
                        pt: None,
                        expiry: Instant::now(),
                        ongoing: None,
                    }),
                })
            })
            .clone()
    }

    /// The cached table for `host_key`, if any, and whether it is still
    /// usable (`now < expiry - leeway`).
    pub fn get(&self, host_key: PublicKey) -> Option<(HostPriceTable, bool)> {
        let entry = self.entry(host_key);
        let state = entry.inner.lock();
        let pt = state.pt.clone()?;
        let valid = Instant::now() + PRICE_TABLE_VALIDITY_LEEWAY < state.expiry;
        Some((pt, valid))
    }

    /// Refresh the table for `host_key`, collapsing concurrent refreshes
    /// into one transport call. On success the new table is cached with
    /// `expiry = now + validity`; on failure the cached entry is untouched.
    pub async fn update(
        &self,
        host_key: PublicKey,
        host_addr: &str,
        pay: PriceTablePaymentFn,
    ) -> Result<HostPriceTable> {
        let entry = self.entry(host_key);

        let mut rx = {
            let mut state = entry.inner.lock();
            match &state.ongoing {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.ongoing = Some(rx.clone());

                    // The refresh runs detached so that neither the leader's
                    // nor any waiter's cancellation can abort it mid-flight.
                    let transport = self.transport.clone();
                    let entry = entry.clone();
                    let host_addr = host_addr.to_string();
                    tokio::spawn(async move {
                        debug!(host = %host_key, "refreshing price table");
                        let res = transport
                            .fetch_price_table(&host_addr, host_key, pay)
                            .await;
                        {
                            let mut state = entry.inner.lock();
                            if let Ok(pt) = &res {
                                state.expiry = Instant::now() + pt.validity;
                                state.pt = Some(pt.clone());
                            }
                            state.ongoing = None;
                        }
                        let _ = tx.send(Some(res));
                    });
                    rx
                }
            }
        };

        loop {
            if let Some(res) = rx.borrow_and_update().clone() {
                return res;
            }
            rx.changed().await.map_err(|_| Error::RefreshInterrupted)?;
        }
    }
}
