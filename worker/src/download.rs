//! The download manager and the per-slab download state machine.
//!
//! One manager outlives every download. It keeps a downloader per host with
//! a usable contract, sequences the slab downloads that make up an object,
//! and feeds the decoded bytes to the caller's sink in slab order.
//!
//! # Per-slab algorithm
//!
//! A slab download dispatches `min_shards` primary sector requests to the
//! hosts with the lowest latency estimates, then collects responses. Every
//! error response is immediately replaced with a speculative request to the
//! next-fastest unused host; independently, an overdrive deadline hedges
//! hosts that are merely slow. The slab completes as soon as `min_shards`
//! sectors arrived; leftover in-flight requests are cancelled.
//!
//! # Pipelining
//!
//! At most [`MAX_CONCURRENT_SLABS_PER_DOWNLOAD`] slabs are in flight per
//! object. The producer holds the next slab until the current one signals
//! that it is close enough to completion (`num_completed + max_overdrive >=
//! min_shards`), so a single slow slab cannot stall the pipeline, yet slabs
//! cannot run arbitrarily far ahead of the sink.

use crate::downloader::{Downloader, DownloaderStats, SectorDownloadReq, SectorDownloadResp};
use crate::error::{Error, Result};
use crate::host::HostProvider;
use crate::stats::DataPoints;
use common::object::{Object, Slab, SlabSlice};
use common::{Contract, Hash256, PublicKey, SECTOR_SIZE};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// At most this many slabs are in flight per object download.
pub(crate) const MAX_CONCURRENT_SLABS_PER_DOWNLOAD: usize = 3;

/// Opaque 8-byte identifier used for trace correlation only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id([u8; 8]);

impl Id {
    fn new() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

/// Engine configuration. All of it is fixed at construction; there are no
/// environment variables or files involved.
#[derive(Clone, Debug)]
pub struct DownloadConfig {
    /// Upper bound on speculative requests beyond the erasure threshold.
    /// Zero disables hedging; failed requests are still replaced.
    pub max_overdrive: u64,
    /// Inactivity window after which a speculative request is dispatched.
    /// Zero disables the overdrive deadline entirely.
    pub overdrive_timeout: Duration,
    /// Half-life applied to the per-host latency estimates.
    pub stats_decay_half_time: Duration,
    /// Minimum interval between stats recomputes across all downloaders.
    pub stats_recompute_min_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_overdrive: 5,
            overdrive_timeout: Duration::from_secs(3),
            stats_decay_half_time: Duration::from_secs(10 * 60),
            stats_recompute_min_interval: Duration::from_secs(3),
        }
    }
}

/// Aggregated engine stats.
#[derive(Clone, Debug)]
pub struct DownloadManagerStats {
    pub avg_download_speed_mbps: f64,
    pub avg_overdrive_pct: f64,
    pub downloaders: HashMap<PublicKey, DownloaderStats>,
}

struct SlabDownloadResponse {
    index: usize,
    result: Result<Vec<Vec<u8>>>,
}

pub(crate) struct ManagerInner {
    host_provider: Arc<dyn HostProvider>,

    max_overdrive: u64,
    overdrive_timeout: Duration,
    stats_decay_half_time: Duration,
    stats_recompute_min_interval: Duration,

    stats_overdrive_pct: Mutex<DataPoints>,
    stats_slab_download_speed_bytes_per_ms: Mutex<DataPoints>,

    stop: CancellationToken,

    pub(crate) downloaders: DashMap<PublicKey, Arc<Downloader>>,
    ongoing: DashSet<Id>,
    last_recompute: Mutex<Option<Instant>>,
}

/// Entry point of the engine: downloads objects and single slabs against a
/// set of host contracts supplied per invocation.
pub struct DownloadManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl DownloadManager {
    pub fn new(host_provider: Arc<dyn HostProvider>, config: DownloadConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                host_provider,
                max_overdrive: config.max_overdrive,
                overdrive_timeout: config.overdrive_timeout,
                stats_decay_half_time: config.stats_decay_half_time,
                stats_recompute_min_interval: config.stats_recompute_min_interval,
                stats_overdrive_pct: Mutex::new(DataPoints::new(Duration::ZERO)),
                stats_slab_download_speed_bytes_per_ms: Mutex::new(DataPoints::new(
                    Duration::ZERO,
                )),
                stop: CancellationToken::new(),
                downloaders: DashMap::new(),
                ongoing: DashSet::new(),
                last_recompute: Mutex::new(None),
            }),
        }
    }

    /// Download `[offset, offset + length)` of `object` into `sink`,
    /// decrypted and in order. The first slab failure aborts the download.
    pub async fn download_object<W>(
        &self,
        sink: &mut W,
        object: &Object,
        offset: u64,
        length: u64,
        contracts: &[Contract],
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let download_id = Id::new();

        // calculate what slabs we need
        let slabs = slabs_for_download(&object.slabs, offset, length);
        if slabs.is_empty() {
            return Ok(());
        }
        debug!(
            dl = %download_id,
            offset,
            length,
            slabs = slabs.len(),
            "starting object download"
        );

        // everything spawned below dies with this invocation
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();

        self.inner.refresh_downloaders(contracts);
        let hosts: HashSet<PublicKey> = contracts.iter().map(|c| c.host_key).collect();

        // wrap the sink in the object's decrypting writer
        let mut cw = object.key.decrypt(&mut *sink, offset);

        let (resp_tx, mut resp_rx) = mpsc::channel::<SlabDownloadResponse>(slabs.len());
        let (next_tx, mut next_rx) = mpsc::channel::<()>(1);
        let _ = next_tx.try_send(()); // seed so slab 0 dispatches immediately

        // producer: one slab at a time, gated on the trigger channel
        let mgr = self.inner.clone();
        let producer_cancel = cancel.clone();
        let producer_slabs = slabs.clone();
        let producer_next_tx = next_tx.clone();
        tokio::spawn(async move {
            for (index, slice) in producer_slabs.into_iter().enumerate() {
                tokio::select! {
                    _ = producer_cancel.cancelled() => return,
                    token = next_rx.recv() => {
                        if token.is_none() {
                            return;
                        }
                    }
                }

                // a slab with fewer reachable hosts than its threshold can
                // never complete; fail the object before dispatching
                let available = slice
                    .slab
                    .shards
                    .iter()
                    .filter(|s| hosts.contains(&s.host))
                    .count();
                if available < slice.slab.min_shards as usize {
                    let resp = SlabDownloadResponse {
                        index,
                        result: Err(Error::NotEnoughHosts {
                            available,
                            required: slice.slab.min_shards as usize,
                        }),
                    };
                    tokio::select! {
                        _ = producer_cancel.cancelled() => {}
                        _ = resp_tx.send(resp) => {}
                    }
                    return;
                }

                tokio::spawn(mgr.clone().download_slab_task(
                    producer_cancel.clone(),
                    download_id,
                    slice,
                    index,
                    resp_tx.clone(),
                    producer_next_tx.clone(),
                ));
            }
        });

        // consumer: slab responses may arrive out of order; buffer them and
        // flush to the sink strictly by index
        let mut responses: HashMap<usize, Vec<Vec<u8>>> = HashMap::new();
        let mut resp_index = 0usize;
        while resp_index < slabs.len() {
            let resp = tokio::select! {
                _ = self.inner.stop.cancelled() => return Err(Error::Stopped),
                resp = resp_rx.recv() => resp.ok_or(Error::Cancelled)?,
            };
            match resp.result {
                Err(e) => {
                    error!(dl = %download_id, slab = resp.index, error = %e, "slab download failed");
                    return Err(e);
                }
                Ok(shards) => {
                    responses.insert(resp.index, shards);
                }
            }
            while let Some(mut shards) = responses.remove(&resp_index) {
                let slice = &slabs[resp_index];
                slice.decrypt(&mut shards)?;
                slice.recover(&mut cw, &mut shards).await?;
                resp_index += 1;
            }
        }
        cw.flush().await.map_err(|e| Error::Codec(e.to_string()))?;
        Ok(())
    }

    /// Download one whole slab and return its full shard matrix, including
    /// reconstructed shards. Used by the repair path.
    pub async fn download_slab(
        &self,
        slab: &Slab,
        contracts: &[Contract],
    ) -> Result<Vec<Vec<u8>>> {
        self.inner.refresh_downloaders(contracts);

        let available_hosts: HashSet<PublicKey> = contracts.iter().map(|c| c.host_key).collect();
        let available = slab
            .shards
            .iter()
            .filter(|s| available_hosts.contains(&s.host))
            .count();
        if available < slab.min_shards as usize {
            return Err(Error::NotEnoughHosts {
                available,
                required: slab.min_shards as usize,
            });
        }

        let slice = SlabSlice {
            slab: slab.clone(),
            offset: 0,
            length: slab.min_shards as u32 * SECTOR_SIZE as u32,
        };

        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        let (resp_tx, mut resp_rx) = mpsc::channel(1);
        // single-slab downloads have no pipeline; the trigger goes nowhere
        let (next_tx, _next_rx) = mpsc::channel(1);
        tokio::spawn(self.inner.clone().download_slab_task(
            cancel.clone(),
            Id::new(),
            slice.clone(),
            0,
            resp_tx,
            next_tx,
        ));

        let resp = tokio::select! {
            _ = self.inner.stop.cancelled() => return Err(Error::Stopped),
            resp = resp_rx.recv() => resp.ok_or(Error::Cancelled)?,
        };
        let mut shards = resp.result?;
        slice.decrypt(&mut shards)?;
        slice.slab.reconstruct(&mut shards)?;
        Ok(shards)
    }

    pub fn stats(&self) -> DownloadManagerStats {
        self.inner.try_recompute_stats();

        let downloaders = self
            .inner
            .downloaders
            .iter()
            .map(|entry| (*entry.key(), entry.value().stats()))
            .collect();

        DownloadManagerStats {
            // convert bytes per ms to megabits per second
            avg_download_speed_mbps: self
                .inner
                .stats_slab_download_speed_bytes_per_ms
                .lock()
                .average()
                * 0.008,
            avg_overdrive_pct: self.inner.stats_overdrive_pct.lock().average(),
            downloaders,
        }
    }

    /// Stop the manager and every downloader. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.cancel();
        for entry in self.inner.downloaders.iter() {
            entry.value().stop();
        }
    }
}

impl ManagerInner {
    /// Align the downloader set with the given contracts: hosts that lost
    /// their contract are stopped and dropped, new hosts get a fresh
    /// downloader, surviving ones keep their queue and stats.
    pub(crate) fn refresh_downloaders(&self, contracts: &[Contract]) {
        let want: HashMap<PublicKey, &Contract> =
            contracts.iter().map(|c| (c.host_key, c)).collect();

        self.downloaders.retain(|host_key, downloader| {
            if want.contains_key(host_key) {
                true
            } else {
                debug!(host = %host_key, "dropping downloader without contract");
                downloader.stop();
                false
            }
        });

        for (host_key, contract) in want {
            if self.downloaders.contains_key(&host_key) {
                continue;
            }
            let host = self
                .host_provider
                .new_host(contract.id, host_key, &contract.host_addr);
            let downloader = Arc::new(Downloader::new(host, self.stats_decay_half_time));
            tokio::spawn(downloader.clone().process_queue());
            self.downloaders.insert(host_key, downloader);
        }
    }

    fn launch(&self, req: SectorDownloadReq) -> Result<()> {
        match self.downloaders.get(&req.host_key) {
            Some(downloader) => {
                downloader.enqueue(req);
                Ok(())
            }
            None => Err(Error::NoDownloader(req.host_key)),
        }
    }

    /// The host with the lowest latency estimate, if any of the given hosts
    /// has a running downloader.
    pub(crate) fn fastest(&self, hosts: &[PublicKey]) -> Option<PublicKey> {
        self.try_recompute_stats();

        let mut fastest = None;
        let mut lowest = f64::MAX;
        for host_key in hosts {
            let Some(downloader) = self.downloaders.get(host_key) else {
                continue;
            };
            let estimate = downloader.estimate();
            if estimate < lowest {
                lowest = estimate;
                fastest = Some(*host_key);
            }
        }
        fastest
    }

    fn try_recompute_stats(&self) {
        let mut last = self.last_recompute.lock();
        if let Some(t) = *last {
            if t.elapsed() < self.stats_recompute_min_interval {
                return;
            }
        }
        *last = Some(Instant::now());
        for entry in self.downloaders.iter() {
            entry.value().recompute_stats();
        }
    }

    fn num_downloaders(&self) -> usize {
        self.downloaders.len()
    }

    fn ongoing_downloads(&self) -> usize {
        self.ongoing.len()
    }

    fn new_slab_download(
        self: &Arc<Self>,
        download_id: Id,
        slice: &SlabSlice,
        index: usize,
    ) -> (SlabDownload, OngoingGuard) {
        let slab_id = Id::new();
        self.ongoing.insert(slab_id);
        let guard = OngoingGuard {
            mgr: self.clone(),
            slab_id,
        };

        let (offset, length) = slice.sector_region();

        let mut host_to_sectors: HashMap<PublicKey, VecDeque<SectorInfo>> = HashMap::new();
        for (index, shard) in slice.slab.shards.iter().enumerate() {
            host_to_sectors
                .entry(shard.host)
                .or_default()
                .push_back(SectorInfo {
                    root: shard.root,
                    index,
                });
        }

        let num_sectors = slice.slab.shards.len();
        (
            SlabDownload {
                mgr: self.clone(),
                download_id,
                slab_id,
                created: Instant::now(),
                index,
                min_shards: slice.slab.min_shards as usize,
                offset,
                length,
                num_sectors,
                state: Mutex::new(SlabState {
                    last_overdrive: None,
                    num_completed: 0,
                    num_inflight: 0,
                    num_launched: 0,
                    num_overdriving: 0,
                    curr: None,
                    host_to_sectors,
                    used: HashSet::new(),
                    sectors: vec![Vec::new(); num_sectors],
                    errs: Default::default(),
                }),
            },
            guard,
        )
    }

    async fn download_slab_task(
        self: Arc<Self>,
        cancel: CancellationToken,
        download_id: Id,
        slice: SlabSlice,
        index: usize,
        resp_tx: mpsc::Sender<SlabDownloadResponse>,
        next_slab_tx: mpsc::Sender<()>,
    ) {
        let (slab, _ongoing) = self.new_slab_download(download_id, &slice, index);
        let result = slab.download_shards(cancel.clone(), &next_slab_tx).await;

        if cancel.is_cancelled() {
            return;
        }
        let resp = SlabDownloadResponse { index, result };
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = resp_tx.send(resp) => {}
        }
    }
}

/// Removes the slab from the manager's ongoing set when the download exits.
struct OngoingGuard {
    mgr: Arc<ManagerInner>,
    slab_id: Id,
}

impl Drop for OngoingGuard {
    fn drop(&mut self) {
        self.mgr.ongoing.remove(&self.slab_id);
    }
}

struct SectorInfo {
    root: Hash256,
    index: usize,
}

struct SlabState {
    last_overdrive: Option<Instant>,
    num_completed: usize,
    num_inflight: u64,
    num_launched: u64,
    num_overdriving: u64,

    curr: Option<PublicKey>,
    host_to_sectors: HashMap<PublicKey, VecDeque<SectorInfo>>,
    used: HashSet<PublicKey>,

    sectors: Vec<Vec<u8>>,
    errs: crate::error::HostErrorSet,
}

/// State of one in-flight slab download.
struct SlabDownload {
    mgr: Arc<ManagerInner>,

    download_id: Id,
    slab_id: Id,
    created: Instant,
    index: usize,
    min_shards: usize,
    offset: u32,
    length: u32,
    num_sectors: usize,

    state: Mutex<SlabState>,
}

impl SlabDownload {
    /// Download at least `min_shards` sectors and return the shard matrix.
    async fn download_shards(
        &self,
        cancel: CancellationToken,
        next_slab_tx: &mpsc::Sender<()>,
    ) -> Result<Vec<Vec<u8>>> {
        // leftover requests (overdrive, slow hosts) die with this token
        let req_cancel = cancel.child_token();
        let _req_guard = req_cancel.clone().drop_guard();

        // every launched request can produce at most one response
        let (resp_tx, mut resp_rx) = mpsc::channel::<SectorDownloadResp>(self.num_sectors.max(1));

        // launch the primary requests
        for _ in 0..self.min_shards {
            let req = self.next_request(&resp_tx, &req_cancel, false);
            if self.launch(req).is_err() {
                return Err(Error::NoHostsAvailable);
            }
        }

        let overdrive_enabled = !self.mgr.overdrive_timeout.is_zero();
        let mut deadline = Instant::now() + self.overdrive_delay();
        let mut done = false;
        let mut triggered = false;

        while self.inflight() > 0 && !done {
            tokio::select! {
                _ = self.mgr.stop.cancelled() => return Err(Error::Stopped),
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline), if overdrive_enabled => {
                    if self.can_overdrive() {
                        debug!(dl = %self.download_id, slab = %self.slab_id, "overdriving");
                        let _ = self.launch(self.next_request(&resp_tx, &req_cancel, true));
                    }
                    deadline = Instant::now() + self.overdrive_delay();
                }
                resp = resp_rx.recv() => {
                    let resp = resp.expect("a response sender is always held");
                    deadline = Instant::now() + self.overdrive_delay();

                    let failed = resp.result.is_err();
                    let (finished, next) = self.receive(resp);
                    done = finished;

                    // replace a failed request right away instead of waiting
                    // for the overdrive deadline
                    if !done && failed {
                        let _ = self.launch(self.next_request(&resp_tx, &req_cancel, true));
                    }

                    if next
                        && !triggered
                        && self.mgr.ongoing_downloads() < MAX_CONCURRENT_SLABS_PER_DOWNLOAD
                    {
                        triggered = next_slab_tx.try_send(()).is_ok();
                    }
                }
            }
        }

        // make sure the next slab is released even if the trigger gating
        // never fired
        if done && !triggered {
            let _ = next_slab_tx.try_send(());
        }

        self.mgr
            .stats_overdrive_pct
            .lock()
            .track(self.overdrive_pct());
        self.mgr
            .stats_slab_download_speed_bytes_per_ms
            .lock()
            .track(self.download_speed());
        self.finish()
    }

    /// Pop the next unassigned sector, switching to the fastest unused host
    /// whenever the current one runs out.
    fn next_request(
        &self,
        resp_tx: &mpsc::Sender<SectorDownloadResp>,
        cancel: &CancellationToken,
        overdrive: bool,
    ) -> Option<SectorDownloadReq> {
        let mut state = self.state.lock();

        let curr_exhausted = match state.curr {
            Some(curr) => state
                .host_to_sectors
                .get(&curr)
                .is_none_or(|sectors| sectors.is_empty()),
            None => true,
        };
        if curr_exhausted {
            let candidates: Vec<PublicKey> = state
                .host_to_sectors
                .keys()
                .filter(|host| !state.used.contains(*host))
                .copied()
                .collect();
            let fastest = self.mgr.fastest(&candidates)?;
            state.used.insert(fastest);
            state.curr = Some(fastest);
        }

        let curr = state.curr?;
        let sector = state.host_to_sectors.get_mut(&curr)?.pop_front()?;
        Some(SectorDownloadReq {
            root: sector.root,
            offset: self.offset,
            length: self.length,
            host_key: curr,
            overdrive,
            sector_index: sector.index,
            response_tx: resp_tx.clone(),
            cancel: cancel.clone(),
        })
    }

    fn launch(&self, req: Option<SectorDownloadReq>) -> Result<()> {
        let mut state = self.state.lock();
        let req = req.ok_or(Error::NoHostsAvailable)?;
        let overdrive = req.overdrive;
        self.mgr.launch(req)?;

        state.num_inflight += 1;
        state.num_launched += 1;
        if overdrive {
            state.num_overdriving += 1;
        }
        Ok(())
    }

    fn receive(&self, resp: SectorDownloadResp) -> (bool, bool) {
        let mut state = self.state.lock();

        if resp.overdrive {
            state.num_overdriving -= 1;
        }
        state.num_inflight -= 1;

        match resp.result {
            Err(e) => {
                state.errs.push(resp.host_key, e);
                (false, false)
            }
            Ok(sector) => {
                state.sectors[resp.sector_index] = sector;
                state.num_completed += 1;
                (
                    state.num_completed >= self.min_shards,
                    state.num_completed + self.mgr.max_overdrive as usize >= self.min_shards,
                )
            }
        }
    }

    /// Each outstanding overdrive pushes the next deadline further out.
    fn overdrive_delay(&self) -> Duration {
        let outstanding = self.state.lock().num_overdriving;
        self.mgr.overdrive_timeout * (outstanding + 1) as u32
    }

    fn can_overdrive(&self) -> bool {
        let mut state = self.state.lock();

        let timeout = self.mgr.overdrive_timeout * (state.num_overdriving + 1) as u32;
        if let Some(last) = state.last_overdrive {
            if last.elapsed() < timeout {
                return false;
            }
        }

        // overdrive is maxed out
        let remaining = (self.min_shards.saturating_sub(state.num_completed)) as u64;
        if state.num_inflight >= self.mgr.max_overdrive + remaining {
            return false;
        }

        state.last_overdrive = Some(Instant::now());
        true
    }

    fn inflight(&self) -> u64 {
        self.state.lock().num_inflight
    }

    fn overdrive_pct(&self) -> f64 {
        let state = self.state.lock();
        let num_overdrive = state.num_launched.saturating_sub(self.min_shards as u64);
        num_overdrive as f64 / self.min_shards as f64
    }

    fn download_speed(&self) -> f64 {
        let bytes = (self.num_sectors * SECTOR_SIZE) as u128;
        let ms = self.created.elapsed().as_millis().max(1);
        (bytes / ms) as f64
    }

    fn finish(&self) -> Result<Vec<Vec<u8>>> {
        let mut state = self.state.lock();
        if state.num_completed < self.min_shards {
            return Err(Error::SlabDownloadFailed {
                completed: state.num_completed,
                inflight: state.num_inflight,
                launched: state.num_launched,
                downloaders: self.mgr.num_downloaders(),
                errs: state.errs.clone(),
            });
        }
        debug!(
            dl = %self.download_id,
            slab = %self.slab_id,
            index = self.index,
            completed = state.num_completed,
            launched = state.num_launched,
            "slab download finished"
        );
        Ok(std::mem::take(&mut state.sectors))
    }
}

/// Slice the in-order slab sequence down to the part covering
/// `[offset, offset + length)`: the first slice's offset is advanced by the
/// intra-slab offset and the last slice's length truncated.
///
/// Panics if the range does not fit in 32 bits per slab.
pub fn slabs_for_download(slabs: &[SlabSlice], offset: u64, length: u64) -> Vec<SlabSlice> {
    if length == 0 {
        return Vec::new();
    }

    let cast32 = |v: u64| -> u32 {
        u32::try_from(v).expect("slabs_for_download: overflow detected")
    };

    let mut slabs = slabs.to_vec();

    let mut first_offset = offset;
    let mut first = 0;
    while first < slabs.len() {
        if first_offset <= slabs[first].length as u64 {
            break;
        }
        first_offset -= slabs[first].length as u64;
        first += 1;
    }
    slabs.drain(..first);
    slabs[0].offset += cast32(first_offset);
    slabs[0].length -= cast32(first_offset);

    let mut last_length = length;
    let mut last = 0;
    while last < slabs.len() {
        if last_length <= slabs[last].length as u64 {
            break;
        }
        last_length -= slabs[last].length as u64;
        last += 1;
    }
    slabs.truncate(last + 1);
    let tail = slabs.last_mut().expect("range fits the slab sequence");
    tail.length = cast32(last_length);

    slabs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use async_trait::async_trait;
    use common::object::{EncryptionKey, Sector};
    use common::ContractId;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // fixtures
    // ------------------------------------------------------------------

    /// Tracks how many distinct slabs have sectors in flight at once.
    #[derive(Default)]
    struct SlabProbe {
        root_slab: Mutex<HashMap<Hash256, usize>>,
        active: Mutex<HashMap<usize, usize>>,
        max_distinct: AtomicUsize,
    }

    impl SlabProbe {
        fn enter(&self, root: &Hash256) {
            let slab = *self.root_slab.lock().get(root).unwrap();
            let mut active = self.active.lock();
            *active.entry(slab).or_default() += 1;
            let distinct = active.values().filter(|c| **c > 0).count();
            self.max_distinct.fetch_max(distinct, Ordering::SeqCst);
        }

        fn exit(&self, root: &Hash256) {
            let slab = *self.root_slab.lock().get(root).unwrap();
            *self.active.lock().get_mut(&slab).unwrap() -= 1;
        }
    }

    struct TestHost {
        host_key: PublicKey,
        sectors: Mutex<HashMap<Hash256, Vec<u8>>>,
        delay: Mutex<Duration>,
        delay_overrides: Mutex<HashMap<Hash256, Duration>>,
        fail_with: Mutex<Option<Error>>,
        probe: Arc<SlabProbe>,
    }

    #[async_trait]
    impl Host for TestHost {
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
            self.probe.enter(&root);
            let delay = self
                .delay_overrides
                .lock()
                .get(&root)
                .copied()
                .unwrap_or(*self.delay.lock());
            tokio::time::sleep(delay).await;
            self.probe.exit(&root);

            if let Some(e) = self.fail_with.lock().clone() {
                return Err(e);
            }
            let region = {
                let sectors = self.sectors.lock();
                let data = sectors.get(&root).ok_or(Error::SectorNotFound)?;
                let end = (offset + length) as usize;
                assert!(end <= data.len(), "request beyond stored sector");
                data[offset as usize..end].to_vec()
            };
            sink.write_all(&region)
                .await
                .map_err(|e| Error::Transport(e.to_string()))
        }
    }

    struct TestHostProvider {
        hosts: HashMap<PublicKey, Arc<TestHost>>,
    }

    impl HostProvider for TestHostProvider {
        fn new_host(
            &self,
            _contract_id: ContractId,
            host_key: PublicKey,
            _host_addr: &str,
        ) -> Arc<dyn Host> {
            self.hosts[&host_key].clone()
        }
    }

    struct Fixture {
        object: Object,
        plaintext: Vec<u8>,
        provider: Arc<TestHostProvider>,
        contracts: Vec<Contract>,
        hosts: Vec<Arc<TestHost>>,
        roots: Vec<Vec<Hash256>>,
        probe: Arc<SlabProbe>,
    }

    impl Fixture {
        /// Encode `n_slabs` slabs of `slab_len` plaintext bytes each across
        /// `n_hosts` hosts, shard `i` of every slab on host `i % n_hosts`.
        async fn build(
            n_slabs: usize,
            min_shards: u8,
            total_shards: usize,
            slab_len: usize,
            n_hosts: usize,
        ) -> Self {
            let probe = Arc::new(SlabProbe::default());
            let hosts: Vec<Arc<TestHost>> = (0..n_hosts)
                .map(|i| {
                    Arc::new(TestHost {
                        host_key: PublicKey([i as u8 + 1; 32]),
                        sectors: Mutex::new(HashMap::new()),
                        delay: Mutex::new(Duration::from_millis(10)),
                        delay_overrides: Mutex::new(HashMap::new()),
                        fail_with: Mutex::new(None),
                        probe: probe.clone(),
                    })
                })
                .collect();

            let plaintext: Vec<u8> = (0..n_slabs * slab_len)
                .map(|i| ((i * 7 + i / 251) % 251) as u8)
                .collect();

            // the stored shards carry the object-level ciphertext
            let object_key = EncryptionKey::from_bytes([99u8; 32]);
            let mut ciphertext = Vec::new();
            {
                let mut w = object_key.decrypt(&mut ciphertext, 0);
                w.write_all(&plaintext).await.unwrap();
            }

            let mut slabs = Vec::new();
            let mut roots = Vec::new();
            for slab_index in 0..n_slabs {
                let mut slab_roots = Vec::new();
                let shards: Vec<Sector> = (0..total_shards)
                    .map(|i| {
                        let mut b = [0u8; 32];
                        b[0] = slab_index as u8;
                        b[1] = i as u8;
                        b[2] = 0xfe;
                        let root = Hash256(b);
                        slab_roots.push(root);
                        probe.root_slab.lock().insert(root, slab_index);
                        Sector {
                            host: hosts[i % n_hosts].host_key,
                            root,
                        }
                    })
                    .collect();
                let slab = Slab {
                    key: EncryptionKey::from_bytes([slab_index as u8 + 10; 32]),
                    min_shards,
                    shards,
                };

                let data = &ciphertext[slab_index * slab_len..(slab_index + 1) * slab_len];
                let mut shard_data = slab.encode(data).unwrap();
                slab.encrypt(&mut shard_data).unwrap();
                for (i, sector) in shard_data.into_iter().enumerate() {
                    hosts[i % n_hosts]
                        .sectors
                        .lock()
                        .insert(slab_roots[i], sector);
                }

                roots.push(slab_roots);
                slabs.push(SlabSlice {
                    slab,
                    offset: 0,
                    length: slab_len as u32,
                });
            }

            let contracts: Vec<Contract> = hosts
                .iter()
                .enumerate()
                .map(|(i, h)| Contract {
                    id: ContractId([i as u8 + 1; 32]),
                    host_key: h.host_key,
                    host_addr: format!("host-{}:9981", i),
                })
                .collect();

            Fixture {
                object: Object {
                    key: object_key,
                    slabs,
                },
                plaintext,
                provider: Arc::new(TestHostProvider {
                    hosts: hosts.iter().map(|h| (h.host_key, h.clone())).collect(),
                }),
                contracts,
                hosts,
                roots,
                probe,
            }
        }

        fn set_slab_delay(&self, slab_index: usize, delay: Duration) {
            for (i, root) in self.roots[slab_index].iter().enumerate() {
                self.hosts[i % self.hosts.len()]
                    .delay_overrides
                    .lock()
                    .insert(*root, delay);
            }
        }
    }

    fn test_config(max_overdrive: u64, overdrive_timeout: Duration) -> DownloadConfig {
        DownloadConfig {
            max_overdrive,
            overdrive_timeout,
            stats_decay_half_time: Duration::ZERO,
            stats_recompute_min_interval: Duration::ZERO,
        }
    }

    /// Seed each host's latency estimate so fastest-host selection is
    /// deterministic: host 0 fastest, host 1 next, and so on.
    fn seed_estimates(mgr: &DownloadManager, contracts: &[Contract]) {
        mgr.inner.refresh_downloaders(contracts);
        for (i, c) in contracts.iter().enumerate() {
            let d = mgr.inner.downloaders.get(&c.host_key).unwrap();
            d.stats_sector_download_estimate_in_ms
                .lock()
                .track(((i + 1) * 10) as f64);
        }
    }

    // ------------------------------------------------------------------
    // end-to-end scenarios
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_download_object_happy_path() {
        let fx = Fixture::build(1, 3, 5, 3 * SECTOR_SIZE, 5).await;
        let mgr = DownloadManager::new(
            fx.provider.clone(),
            test_config(2, Duration::from_secs(1)),
        );

        let mut sink = Vec::new();
        mgr.download_object(
            &mut sink,
            &fx.object,
            0,
            fx.plaintext.len() as u64,
            &fx.contracts,
        )
        .await
        .unwrap();

        assert_eq!(sink, fx.plaintext);

        // three primaries, no overdrive
        let stats = mgr.stats();
        assert_eq!(stats.avg_overdrive_pct, 0.0);
        assert_eq!(stats.downloaders.len(), 5);
        let total_downloads: u64 = stats.downloaders.values().map(|d| d.num_downloads).sum();
        assert_eq!(total_downloads, 3);
        assert!(stats.downloaders.values().all(|d| d.healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdrive_hedges_slow_host() {
        let fx = Fixture::build(1, 3, 5, 3 * 1024, 5).await;
        let mgr = DownloadManager::new(
            fx.provider.clone(),
            test_config(1, Duration::from_secs(1)),
        );
        seed_estimates(&mgr, &fx.contracts);

        // host 0 gets a primary and stalls for twice the overdrive timeout
        *fx.hosts[0].delay.lock() = Duration::from_secs(2);

        let mut sink = Vec::new();
        mgr.download_object(
            &mut sink,
            &fx.object,
            0,
            fx.plaintext.len() as u64,
            &fx.contracts,
        )
        .await
        .unwrap();
        assert_eq!(sink, fx.plaintext);

        // exactly one overdrive request on the next-fastest unused host
        let stats = mgr.stats();
        assert!((stats.avg_overdrive_pct - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(
            stats.downloaders[&fx.hosts[3].host_key].num_downloads,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_host_is_replaced_and_penalized() {
        let fx = Fixture::build(1, 3, 5, 3 * 1024, 5).await;
        let mgr = DownloadManager::new(
            fx.provider.clone(),
            test_config(1, Duration::from_secs(60)),
        );
        seed_estimates(&mgr, &fx.contracts);

        *fx.hosts[0].delay.lock() = Duration::from_millis(50);
        *fx.hosts[0].fail_with.lock() = Some(Error::Transport("connection reset".into()));

        let mut sink = Vec::new();
        mgr.download_object(
            &mut sink,
            &fx.object,
            0,
            fx.plaintext.len() as u64,
            &fx.contracts,
        )
        .await
        .unwrap();
        assert_eq!(sink, fx.plaintext);

        let hk0 = fx.hosts[0].host_key;
        let hk4 = fx.hosts[4].host_key;
        let stats = mgr.stats();
        assert!(!stats.downloaders[&hk0].healthy);
        let d0 = mgr.inner.downloaders.get(&hk0).unwrap().clone();
        assert!(d0.estimate() >= 3_600_000.0);
        // the poisoned host loses every fastest-host election
        assert_eq!(mgr.inner.fastest(&[hk0, hk4]), Some(hk4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_hosts_fails_without_dispatch() {
        let fx = Fixture::build(1, 3, 5, 3 * 1024, 5).await;
        let mgr = DownloadManager::new(fx.provider.clone(), test_config(1, Duration::ZERO));

        let two_contracts = fx.contracts[..2].to_vec();
        let mut sink = Vec::new();
        let err = mgr
            .download_object(
                &mut sink,
                &fx.object,
                0,
                fx.plaintext.len() as u64,
                &two_contracts,
            )
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "not enough hosts available to download the slab: 2/3"
        );
        assert!(sink.is_empty());
        // no sector request was ever issued
        let stats = mgr.stats();
        assert!(stats.downloaders.values().all(|d| d.num_downloads == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_slab_pipelining_and_order() {
        let fx = Fixture::build(4, 2, 3, 4096, 3).await;
        let mgr = DownloadManager::new(
            fx.provider.clone(),
            test_config(1, Duration::from_secs(1)),
        );

        let mut sink = Vec::new();
        mgr.download_object(
            &mut sink,
            &fx.object,
            0,
            fx.plaintext.len() as u64,
            &fx.contracts,
        )
        .await
        .unwrap();

        // bytes arrive in slab order regardless of completion order
        assert_eq!(sink, fx.plaintext);
        // never more than three slabs had sectors in flight at once
        assert!(fx.probe.max_distinct.load(Ordering::SeqCst) <= MAX_CONCURRENT_SLABS_PER_DOWNLOAD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_range_download() {
        let fx = Fixture::build(2, 2, 3, 4096, 3).await;
        let mgr = DownloadManager::new(fx.provider.clone(), test_config(1, Duration::ZERO));

        let mut sink = Vec::new();
        mgr.download_object(&mut sink, &fx.object, 1000, 5000, &fx.contracts)
            .await
            .unwrap();
        assert_eq!(sink, fx.plaintext[1000..6000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_length_download_is_a_noop() {
        let fx = Fixture::build(1, 2, 3, 4096, 3).await;
        let mgr = DownloadManager::new(fx.provider.clone(), test_config(1, Duration::ZERO));

        let mut sink = Vec::new();
        mgr.download_object(&mut sink, &fx.object, 100, 0, &fx.contracts)
            .await
            .unwrap();
        assert!(sink.is_empty());
        assert!(mgr.stats().downloaders.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdrive_disabled_still_succeeds() {
        // max_overdrive = 0 and overdrive_timeout = 0: no hedging at all
        let fx = Fixture::build(2, 2, 3, 4096, 3).await;
        let mgr = DownloadManager::new(fx.provider.clone(), test_config(0, Duration::ZERO));

        let mut sink = Vec::new();
        mgr.download_object(
            &mut sink,
            &fx.object,
            0,
            fx.plaintext.len() as u64,
            &fx.contracts,
        )
        .await
        .unwrap();
        assert_eq!(sink, fx.plaintext);
        assert_eq!(mgr.stats().avg_overdrive_pct, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_download() {
        let fx = Fixture::build(2, 2, 3, 4096, 3).await;
        let mgr = DownloadManager::new(
            fx.provider.clone(),
            test_config(1, Duration::from_secs(3600)),
        );

        // the second slab never completes
        fx.set_slab_delay(1, Duration::from_secs(24 * 3600));

        let mut sink = Vec::new();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            mgr.download_object(
                &mut sink,
                &fx.object,
                0,
                fx.plaintext.len() as u64,
                &fx.contracts,
            ),
        )
        .await;
        assert!(res.is_err());

        // everything the sink saw is the in-order prefix from slab 0
        assert_eq!(sink, fx.plaintext[..4096]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_downloads_and_is_idempotent() {
        let fx = Fixture::build(1, 2, 3, 4096, 3).await;
        let mgr = DownloadManager::new(fx.provider.clone(), test_config(1, Duration::ZERO));

        mgr.stop();
        mgr.stop();

        let mut sink = Vec::new();
        let err = mgr
            .download_object(
                &mut sink,
                &fx.object,
                0,
                fx.plaintext.len() as u64,
                &fx.contracts,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_slab_repair_reconstructs_all_shards() {
        let fx = Fixture::build(1, 2, 4, 2 * SECTOR_SIZE, 4).await;
        let mgr = DownloadManager::new(fx.provider.clone(), test_config(1, Duration::ZERO));

        // drop one host's contract; its shard must be reconstructed
        let contracts = fx.contracts[..3].to_vec();
        let slab = fx.object.slabs[0].slab.clone();
        let shards = mgr.download_slab(&slab, &contracts).await.unwrap();

        // compare against the freshly encoded (pre-encryption) matrix
        let object_key = fx.object.key;
        let mut ciphertext = Vec::new();
        {
            let mut w = object_key.decrypt(&mut ciphertext, 0);
            w.write_all(&fx.plaintext).await.unwrap();
        }
        let expected = slab.encode(&ciphertext).unwrap();
        assert_eq!(shards, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_slab_insufficient_hosts() {
        let fx = Fixture::build(1, 3, 5, 3 * 1024, 5).await;
        let mgr = DownloadManager::new(fx.provider.clone(), test_config(1, Duration::ZERO));

        let slab = fx.object.slabs[0].slab.clone();
        let err = mgr
            .download_slab(&slab, &fx.contracts[..2])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotEnoughHosts {
                available: 2,
                required: 3
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_downloaders_prunes_and_reuses() {
        let fx = Fixture::build(1, 2, 3, 4096, 3).await;
        let mgr = DownloadManager::new(fx.provider.clone(), test_config(1, Duration::ZERO));

        mgr.inner.refresh_downloaders(&fx.contracts);
        assert_eq!(mgr.inner.downloaders.len(), 3);
        let before = mgr
            .inner
            .downloaders
            .get(&fx.contracts[0].host_key)
            .unwrap()
            .clone();

        // same contracts: downloaders are reused, not recreated
        mgr.inner.refresh_downloaders(&fx.contracts);
        let after = mgr
            .inner
            .downloaders
            .get(&fx.contracts[0].host_key)
            .unwrap()
            .clone();
        assert!(Arc::ptr_eq(&before, &after));

        // dropping a contract prunes its downloader
        mgr.inner.refresh_downloaders(&fx.contracts[..2]);
        assert_eq!(mgr.inner.downloaders.len(), 2);
        assert!(mgr
            .inner
            .downloaders
            .get(&fx.contracts[2].host_key)
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_concurrent_downloads_return_identical_bytes() {
        let fx = Fixture::build(2, 2, 3, 4096, 3).await;
        let mgr = Arc::new(DownloadManager::new(
            fx.provider.clone(),
            test_config(1, Duration::from_secs(1)),
        ));

        let len = fx.plaintext.len() as u64;
        let object = fx.object.clone();
        let contracts = fx.contracts.clone();
        let mgr2 = mgr.clone();
        let second = tokio::spawn(async move {
            let mut sink = Vec::new();
            mgr2.download_object(&mut sink, &object, 0, len, &contracts)
                .await
                .map(|_| sink)
        });

        let mut sink = Vec::new();
        mgr.download_object(&mut sink, &fx.object, 0, len, &fx.contracts)
            .await
            .unwrap();

        let other = second.await.unwrap().unwrap();
        assert_eq!(sink, fx.plaintext);
        assert_eq!(other, fx.plaintext);
    }

    // ------------------------------------------------------------------
    // slab range selector
    // ------------------------------------------------------------------

    fn slices(lengths: &[u32]) -> Vec<SlabSlice> {
        lengths
            .iter()
            .map(|&length| SlabSlice {
                slab: Slab {
                    key: EncryptionKey::from_bytes([0u8; 32]),
                    min_shards: 1,
                    shards: Vec::new(),
                },
                offset: 0,
                length,
            })
            .collect()
    }

    #[test]
    fn test_slabs_for_download_spanning_range() {
        let s = slices(&[100, 200, 300]);
        let out = slabs_for_download(&s, 150, 300);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].offset, out[0].length), (50, 150));
        assert_eq!((out[1].offset, out[1].length), (0, 150));
    }

    #[test]
    fn test_slabs_for_download_single_slab_tail() {
        let s = slices(&[100, 200]);
        let out = slabs_for_download(&s, 250, 50);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].offset, out[0].length), (150, 50));
    }

    #[test]
    fn test_slabs_for_download_zero_length() {
        let s = slices(&[100, 200]);
        assert!(slabs_for_download(&s, 50, 0).is_empty());
    }

    proptest! {
        /// The returned slices cover exactly `length` bytes.
        #[test]
        fn prop_slabs_for_download_length(
            lengths in prop::collection::vec(1u32..5000, 1..10),
            offset_frac in 0.0f64..1.0,
            length_frac in 0.0f64..1.0,
        ) {
            let total: u64 = lengths.iter().map(|&l| l as u64).sum();
            let offset = (offset_frac * (total - 1) as f64) as u64;
            let length = 1 + (length_frac * (total - offset - 1) as f64) as u64;

            let out = slabs_for_download(&slices(&lengths), offset, length);
            let covered: u64 = out.iter().map(|s| s.length as u64).sum();
            prop_assert_eq!(covered, length);
            // every slice stays within its slab
            for s in &out {
                prop_assert!(s.offset + s.length <= 5000);
            }
        }
    }
}
