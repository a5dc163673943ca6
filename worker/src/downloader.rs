//! Per-host download queue and executor.
//!
//! Every host with a usable contract gets one `Downloader`: a FIFO queue of
//! sector requests drained by a loop that executes up to
//! [`MAX_CONCURRENT_SECTORS_PER_HOST`] requests at a time. The downloader
//! owns the host's latency estimate, which drives the manager's
//! fastest-host selection: successful batches feed real timings, while a
//! blameworthy failure poisons the estimate with a one-hour sample until the
//! host succeeds again.

use crate::error::{Error, Result};
use crate::host::Host;
use crate::stats::DataPoints;
use common::{Hash256, PublicKey, SECTOR_SIZE};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// At most this many sector requests execute concurrently on one host.
pub(crate) const MAX_CONCURRENT_SECTORS_PER_HOST: usize = 3;

/// Accounting overhead added to every successful sector for speed stats.
pub(crate) const DOWNLOAD_OVERHEAD_B: u64 = 284;

/// Latency sample used to poison a host after a blameworthy failure.
const FAILURE_PENALTY_MS: f64 = 3_600_000.0; // one hour

/// One sector request, routed to the downloader of `host_key`.
pub(crate) struct SectorDownloadReq {
    pub root: Hash256,
    pub offset: u32,
    pub length: u32,
    pub host_key: PublicKey,

    pub overdrive: bool,
    pub sector_index: usize,
    pub response_tx: mpsc::Sender<SectorDownloadResp>,
    pub cancel: CancellationToken,
}

impl SectorDownloadReq {
    fn done(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn succeed(&self, sector: Vec<u8>) {
        // the receiver may be gone; losing the response is fine then
        let _ = self.response_tx.try_send(SectorDownloadResp {
            host_key: self.host_key,
            sector_index: self.sector_index,
            overdrive: self.overdrive,
            result: Ok(sector),
        });
    }

    fn fail(&self, err: Error) {
        let _ = self.response_tx.try_send(SectorDownloadResp {
            host_key: self.host_key,
            sector_index: self.sector_index,
            overdrive: self.overdrive,
            result: Err(err),
        });
    }
}

/// Outcome of one sector request.
pub(crate) struct SectorDownloadResp {
    pub host_key: PublicKey,
    pub sector_index: usize,
    pub overdrive: bool,
    pub result: Result<Vec<u8>>,
}

/// Per-downloader stats exposed through the manager.
#[derive(Clone, Debug, PartialEq)]
pub struct DownloaderStats {
    pub avg_speed_mbps: f64,
    pub healthy: bool,
    pub num_downloads: u64,
}

struct DownloaderInner {
    queue: VecDeque<SectorDownloadReq>,
    consecutive_failures: u64,
    num_downloads: u64,
}

/// Request queue and executor for one host.
pub(crate) struct Downloader {
    host: Arc<dyn Host>,

    // exposed speed stat carries no decay; the latency estimate does
    pub(crate) stats_download_speed_bytes_per_ms: Mutex<DataPoints>,
    pub(crate) stats_sector_download_estimate_in_ms: Mutex<DataPoints>,

    signal_work: Notify,
    stop: CancellationToken,

    inner: Mutex<DownloaderInner>,
}

#[derive(Default)]
struct BatchStats {
    start: Option<Instant>,
    concurrent: i64,
    downloaded: u64,
}

impl Downloader {
    pub fn new(host: Arc<dyn Host>, stats_decay_half_time: Duration) -> Self {
        Self {
            host,
            stats_sector_download_estimate_in_ms: Mutex::new(DataPoints::new(
                stats_decay_half_time,
            )),
            stats_download_speed_bytes_per_ms: Mutex::new(DataPoints::new(Duration::ZERO)),
            signal_work: Notify::new(),
            stop: CancellationToken::new(),
            inner: Mutex::new(DownloaderInner {
                queue: VecDeque::new(),
                consecutive_failures: 0,
                num_downloads: 0,
            }),
        }
    }

    pub fn enqueue(&self, req: SectorDownloadReq) {
        self.inner.lock().queue.push_back(req);
        self.signal_work.notify_one();
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stats(&self) -> DownloaderStats {
        let inner = self.inner.lock();
        DownloaderStats {
            avg_speed_mbps: self.stats_download_speed_bytes_per_ms.lock().average() * 0.008,
            healthy: inner.consecutive_failures == 0,
            num_downloads: inner.num_downloads,
        }
    }

    pub fn recompute_stats(&self) {
        self.stats_sector_download_estimate_in_ms.lock().recompute();
        self.stats_download_speed_bytes_per_ms.lock().recompute();
    }

    /// Expected latency, in milliseconds, of completing one more sector on
    /// this host given everything already queued.
    pub fn estimate(&self) -> f64 {
        let per_sector = {
            let stats = self.stats_sector_download_estimate_in_ms.lock();
            let p90 = stats.p90();
            if p90 > 0.0 {
                p90
            } else {
                let avg = stats.average();
                if avg > 0.0 {
                    avg
                } else {
                    1.0
                }
            }
        };
        let num_sectors = (self.inner.lock().queue.len() + 1) as f64;
        num_sectors * per_sector
    }

    fn pop(&self) -> Option<SectorDownloadReq> {
        self.inner.lock().queue.pop_front()
    }

    fn pop_live(&self) -> Option<SectorDownloadReq> {
        loop {
            let req = self.pop()?;
            if !req.done() {
                return Some(req);
            }
        }
    }

    fn fill_batch(&self) -> Vec<SectorDownloadReq> {
        let mut batch = Vec::new();
        while batch.len() < MAX_CONCURRENT_SECTORS_PER_HOST {
            match self.pop_live() {
                Some(req) => batch.push(req),
                None => break,
            }
        }
        batch
    }

    fn track_failure(&self, err: Option<&Error>) {
        match err {
            None => self.inner.lock().consecutive_failures = 0,
            Some(e) if e.is_host_blameless() || e.is_cancellation() => {}
            Some(e) => {
                {
                    let mut inner = self.inner.lock();
                    inner.consecutive_failures += 1;
                }
                // permanent penalty until the next success
                self.stats_sector_download_estimate_in_ms
                    .lock()
                    .track(FAILURE_PENALTY_MS);
                debug!(
                    host = %self.host.public_key(),
                    error = %e,
                    "penalizing host after failed sector download"
                );
            }
        }
    }

    async fn execute(&self, req: &SectorDownloadReq) -> Result<()> {
        let mut buf = Vec::with_capacity(req.length as usize);
        let res = tokio::select! {
            _ = req.cancel.cancelled() => Err(Error::Cancelled),
            r = self.host.download_sector(&mut buf, req.root, req.offset, req.length) => r,
        };
        match res {
            Ok(()) => {
                self.inner.lock().num_downloads += 1;
                req.succeed(buf);
                Ok(())
            }
            Err(e) => {
                if !e.is_cancellation() {
                    req.fail(e.clone());
                }
                Err(e)
            }
        }
    }

    fn flush_stats(&self, stats: &mut BatchStats) {
        let Some(start) = stats.start else { return };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if elapsed_ms == 0 || stats.downloaded == 0 {
            return;
        }
        // whole bytes per millisecond; fractional throughput is noise here
        self.stats_download_speed_bytes_per_ms
            .lock()
            .track((stats.downloaded / elapsed_ms) as f64);
        self.stats_sector_download_estimate_in_ms
            .lock()
            .track(elapsed_ms as f64);
        stats.start = None;
        stats.downloaded = 0;
    }

    async fn process_batch(self: &Arc<Self>, batch: Vec<SectorDownloadReq>) {
        let workers_wanted = batch.len();
        let pending = Arc::new(Mutex::new(VecDeque::from(batch)));
        let stats = Arc::new(Mutex::new(BatchStats::default()));

        let mut workers = JoinSet::new();
        for _ in 0..workers_wanted {
            let d = self.clone();
            let pending = pending.clone();
            let stats = stats.clone();
            workers.spawn(async move {
                loop {
                    if d.stop.is_cancelled() {
                        break;
                    }

                    // drain the batch first, then keep pulling fresh work so
                    // the host stays saturated
                    let req = { pending.lock().pop_front() };
                    let req = match req.or_else(|| d.pop_live()) {
                        Some(req) => req,
                        None => break,
                    };
                    if req.done() {
                        continue;
                    }

                    {
                        let mut s = stats.lock();
                        if s.start.is_none() {
                            s.start = Some(Instant::now());
                        }
                        s.concurrent += 1;
                    }

                    let res = d.execute(&req).await;
                    d.track_failure(res.as_ref().err());

                    {
                        let mut s = stats.lock();
                        if res.is_ok() {
                            s.downloaded += req.length as u64 + DOWNLOAD_OVERHEAD_B;
                            let saturated =
                                s.concurrent == MAX_CONCURRENT_SECTORS_PER_HOST as i64;
                            if saturated
                                || s.downloaded
                                    >= (MAX_CONCURRENT_SECTORS_PER_HOST * SECTOR_SIZE) as u64
                            {
                                d.flush_stats(&mut s);
                            }
                        }
                        s.concurrent -= 1;
                        assert!(s.concurrent >= 0, "concurrent can never be less than zero");
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}

        self.flush_stats(&mut stats.lock());
    }

    /// Drain loop. Runs until the downloader is stopped; waits for the work
    /// signal, then processes batches until the queue is empty.
    pub async fn process_queue(self: Arc<Self>) {
        'outer: loop {
            tokio::select! {
                _ = self.signal_work.notified() => {}
                _ = self.stop.cancelled() => return,
            }

            loop {
                let batch = self.fill_batch();
                if batch.is_empty() {
                    continue 'outer;
                }
                tokio::select! {
                    _ = self.process_batch(batch) => {}
                    _ = self.stop.cancelled() => return,
                }
            }
        }
    }
}
