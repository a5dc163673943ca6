//! Host handles: the capability to download one sector from one host.
//!
//! The engine schedules against the [`Host`] trait only; the concrete
//! [`SectorHost`] glues together the price-table cache and the wire-level
//! [`SectorTransport`]. How a handle pays (ephemeral account or contract
//! revision) is fixed when it is constructed and opaque to the scheduler.

use crate::error::Result;
use crate::pricetable::{HostPriceTable, PriceTablePaymentFn, PriceTables};
use async_trait::async_trait;
use common::{ContractId, Currency, Hash256, PublicKey};
use std::sync::Arc;
use tokio::io::AsyncWrite;

/// A payment attached to a paid RPC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payment {
    EphemeralAccount { account: PublicKey, amount: Currency },
    ContractRevision { contract_id: ContractId, amount: Currency },
}

/// How a [`SectorHost`] pays for its RPCs. Paying from an ephemeral account
/// is preferred since it does not lock the contract; paying by contract
/// revision is the fallback while the account is being funded.
#[derive(Clone, Debug)]
pub enum PaymentPolicy {
    EphemeralAccount { account: PublicKey },
    ContractRevision,
}

/// The capability to download one sector from one host. `sink` receives
/// exactly `length` bytes on success.
#[async_trait]
pub trait Host: Send + Sync {
    fn public_key(&self) -> PublicKey;

    async fn download_sector(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        root: Hash256,
        offset: u32,
        length: u32,
    ) -> Result<()>;
}

/// Constructs host handles from contract metadata. Implemented by the
/// surrounding service; the manager calls it whenever the contract set
/// introduces a host it has no downloader for.
pub trait HostProvider: Send + Sync {
    fn new_host(
        &self,
        contract_id: ContractId,
        host_key: PublicKey,
        host_addr: &str,
    ) -> Arc<dyn Host>;
}

/// Wire-level sector read. The transport is responsible for proof
/// verification and for classifying host responses into [`crate::Error`]
/// kinds.
#[async_trait]
pub trait SectorTransport: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn read_sector(
        &self,
        host_addr: &str,
        host_key: PublicKey,
        pt: &HostPriceTable,
        payment: Payment,
        root: Hash256,
        offset: u32,
        length: u32,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
}

/// Default [`Host`] implementation: price-table aware, payment-policy bound.
pub struct SectorHost {
    contract_id: ContractId,
    host_key: PublicKey,
    host_addr: String,
    payment: PaymentPolicy,
    price_tables: Arc<PriceTables>,
    transport: Arc<dyn SectorTransport>,
}

impl SectorHost {
    fn payment_for(&self, amount: Currency) -> Payment {
        match &self.payment {
            PaymentPolicy::EphemeralAccount { account } => Payment::EphemeralAccount {
                account: *account,
                amount,
            },
            PaymentPolicy::ContractRevision => Payment::ContractRevision {
                contract_id: self.contract_id,
                amount,
            },
        }
    }

    fn price_table_payment(&self) -> PriceTablePaymentFn {
        let policy = self.payment.clone();
        let contract_id = self.contract_id;
        Arc::new(move |pt: &HostPriceTable| {
            Ok(match &policy {
                PaymentPolicy::EphemeralAccount { account } => Payment::EphemeralAccount {
                    account: *account,
                    amount: pt.update_price_table_cost,
                },
                PaymentPolicy::ContractRevision => Payment::ContractRevision {
                    contract_id,
                    amount: pt.update_price_table_cost,
                },
            })
        })
    }

    /// A price table the host will accept, refreshing the cached one if it
    /// is missing or about to expire.
    async fn price_table(&self) -> Result<HostPriceTable> {
        if let Some((pt, true)) = self.price_tables.get(self.host_key) {
            return Ok(pt);
        }
        self.price_tables
            .update(self.host_key, &self.host_addr, self.price_table_payment())
            .await
    }
}

#[async_trait]
impl Host for SectorHost {
    fn public_key(&self) -> PublicKey {
        self.host_key
    }

    async fn download_sector(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        root: Hash256,
        offset: u32,
        length: u32,
    ) -> Result<()> {
        let pt = self.price_table().await?;
        let payment = self.payment_for(pt.download_sector_cost);
        self.transport
            .read_sector(
                &self.host_addr,
                self.host_key,
                &pt,
                payment,
                root,
                offset,
                length,
                sink,
            )
            .await
    }
}

/// [`HostProvider`] producing [`SectorHost`] handles that share one
/// price-table cache and one transport.
pub struct SectorHostProvider {
    price_tables: Arc<PriceTables>,
    transport: Arc<dyn SectorTransport>,
    payment: PaymentPolicy,
}

impl SectorHostProvider {
    pub fn new(
        price_tables: Arc<PriceTables>,
        transport: Arc<dyn SectorTransport>,
        payment: PaymentPolicy,
    ) -> Self {
        Self {
            price_tables,
            transport,
            payment,
        }
    }
}

impl HostProvider for SectorHostProvider {
    fn new_host(
        &self,
        contract_id: ContractId,
        host_key: PublicKey,
        host_addr: &str,
    ) -> Arc<dyn Host> {
        Arc::new(SectorHost {
            contract_id,
            host_key,
            host_addr: host_addr.to_string(),
            payment: self.payment.clone(),
            price_tables: self.price_tables.clone(),
            transport: self.transport.clone(),
        })
    }
}
