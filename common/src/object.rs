//! Object model and codec for erasure-coded user data.
//!
//! An object is an ordered list of slab slices. Each slab is independently
//! erasure-coded into `shards.len()` sectors of which any `min_shards`
//! reconstruct the plaintext, and independently encrypted: every shard is
//! XORed with an XChaCha20 keystream derived from the slab key and the shard
//! index, and the object plaintext is additionally XORed with a keystream
//! derived from the object key.
//!
//! # Data layout
//!
//! Slab plaintext is striped across the first `min_shards` shards in
//! [`LEAF_SIZE`]-byte leaves: leaf `i` of the plaintext lands in row
//! `i / min_shards` of shard `i % min_shards`. Consecutive leaves go to
//! consecutive data shards, so a read of `[offset, offset + length)` touches
//! the same leaf-aligned region of every shard;
//! [`SlabSlice::sector_region`] computes that region.

use crate::{Hash256, PublicKey, LEAF_SIZE, SECTOR_SIZE};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::XChaCha20;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Errors surfaced by the codec. These are fatal for the download that hits
/// them; there is no partial recovery from a bad shard matrix.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("expected {expected} shards, got {got}")]
    ShardCountMismatch { expected: usize, got: usize },
    #[error("not enough shards to recover: {present}/{required}")]
    NotEnoughShards { present: usize, required: usize },
    #[error("shard size {got} is not a multiple of the leaf size")]
    UnalignedShard { got: usize },
    #[error("keystream offset out of range")]
    KeystreamOverflow,
    #[error("erasure coding failed: {0}")]
    Erasure(String),
    #[error("sink write failed: {0}")]
    Sink(String),
}

impl From<reed_solomon_erasure::Error> for CodecError {
    fn from(e: reed_solomon_erasure::Error) -> Self {
        CodecError::Erasure(e.to_string())
    }
}

/// Key used for both object-level and slab-level stream encryption.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn new() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    /// XOR `buf` with the keystream for `nonce`, starting `offset` bytes in.
    fn apply(&self, nonce: &[u8; 24], offset: u64, buf: &mut [u8]) -> Result<(), CodecError> {
        let mut cipher = XChaCha20::new(&self.0.into(), &(*nonce).into());
        cipher
            .try_seek(offset)
            .map_err(|_| CodecError::KeystreamOverflow)?;
        cipher.apply_keystream(buf);
        Ok(())
    }

    /// Wrap `inner` in a writer that decrypts the object keystream, indexed
    /// from byte `offset` of the object plaintext.
    pub fn decrypt<W: AsyncWrite + Unpin>(&self, inner: W, offset: u64) -> CipherWriter<W> {
        CipherWriter {
            inner,
            key: *self,
            pos: offset,
            scratch: Vec::new(),
        }
    }
}

impl Default for EncryptionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        f.write_str("EncryptionKey(...)")
    }
}

/// One encoded piece of a slab: a host that stores it and the Merkle root
/// that identifies it on that host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    pub host: PublicKey,
    pub root: Hash256,
}

/// An erasure-coded unit. Any `min_shards` of its `shards` suffice to
/// reconstruct the plaintext. The first `min_shards` entries are the data
/// shards, the rest parity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slab {
    pub key: EncryptionKey,
    pub min_shards: u8,
    pub shards: Vec<Sector>,
}

/// A contiguous byte range within a slab's plaintext.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlabSlice {
    pub slab: Slab,
    pub offset: u32,
    pub length: u32,
}

/// A stored user object: an ordered list of slab slices plus the object-level
/// encryption key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Object {
    pub key: EncryptionKey,
    pub slabs: Vec<SlabSlice>,
}

impl Slab {
    fn shard_nonce(index: usize) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[1] = index as u8;
        nonce
    }

    fn data_shards(&self) -> usize {
        self.min_shards as usize
    }

    fn parity_shards(&self) -> usize {
        self.shards.len() - self.data_shards()
    }

    /// Erasure-code `data` into `shards.len()` equally sized, leaf-aligned
    /// shards. The upload side of [`SlabSlice::recover`]; the engine's tests
    /// use it to build host state.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        let k = self.data_shards();
        let m = self.parity_shards();
        let chunk = LEAF_SIZE as usize * k;
        let rows = data.len().div_ceil(chunk).max(1);
        let shard_size = rows * LEAF_SIZE as usize;

        // stripe the plaintext leaf by leaf, zero-padding the tail
        let mut shards = vec![vec![0u8; shard_size]; k + m];
        for (leaf_index, leaf) in data.chunks(LEAF_SIZE as usize).enumerate() {
            let shard = leaf_index % k;
            let row = leaf_index / k;
            let start = row * LEAF_SIZE as usize;
            shards[shard][start..start + leaf.len()].copy_from_slice(leaf);
        }

        if m > 0 {
            let rs = ReedSolomon::new(k, m)?;
            rs.encode(&mut shards)?;
        }
        Ok(shards)
    }

    /// Encrypt freshly encoded shards in place, each with its own keystream.
    pub fn encrypt(&self, shards: &mut [Vec<u8>]) -> Result<(), CodecError> {
        for (i, shard) in shards.iter_mut().enumerate() {
            self.key.apply(&Self::shard_nonce(i), 0, shard)?;
        }
        Ok(())
    }

    /// Reconstruct every shard, data and parity, from the present ones.
    /// `shards` holds one full sector per index; empty entries are missing
    /// and are filled in on success. Used by the repair path.
    pub fn reconstruct(&self, shards: &mut [Vec<u8>]) -> Result<(), CodecError> {
        if shards.len() != self.shards.len() {
            return Err(CodecError::ShardCountMismatch {
                expected: self.shards.len(),
                got: shards.len(),
            });
        }

        let present = shards.iter().filter(|s| !s.is_empty()).count();
        if present < self.data_shards() {
            return Err(CodecError::NotEnoughShards {
                present,
                required: self.data_shards(),
            });
        }
        if present == shards.len() {
            return Ok(());
        }

        let rs = ReedSolomon::new(self.data_shards(), self.parity_shards())?;
        let mut slots: Vec<Option<Vec<u8>>> = shards
            .iter_mut()
            .map(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(std::mem::take(s))
                }
            })
            .collect();
        rs.reconstruct(&mut slots)?;
        for (shard, slot) in shards.iter_mut().zip(slots) {
            *shard = slot.expect("reconstruct fills every shard");
        }
        Ok(())
    }
}

impl SlabSlice {
    /// The leaf-aligned byte region every shard must serve to cover this
    /// slice: `offset % LEAF_SIZE == 0` and the region fits inside a sector.
    pub fn sector_region(&self) -> (u32, u32) {
        let chunk = LEAF_SIZE * self.slab.min_shards as u32;
        let start = self.offset / chunk * LEAF_SIZE;
        let end = (self.offset + self.length).div_ceil(chunk) * LEAF_SIZE;
        debug_assert!(end as usize <= SECTOR_SIZE);
        (start, end - start)
    }

    /// Decrypt downloaded shard regions in place. Each shard's keystream is
    /// seeked to the region offset within the sector.
    pub fn decrypt(&self, shards: &mut [Vec<u8>]) -> Result<(), CodecError> {
        let (offset, _) = self.sector_region();
        for (i, shard) in shards.iter_mut().enumerate() {
            if shard.is_empty() {
                continue;
            }
            self.slab
                .key
                .apply(&Slab::shard_nonce(i), offset as u64, shard)?;
        }
        Ok(())
    }

    /// Reconstruct any missing data shards, then join the striped plaintext
    /// and write exactly `self.length` bytes of it to `sink`.
    ///
    /// `shards` holds the decrypted sector regions, one entry per shard
    /// index, empty entries missing. Only the data shards are reconstructed;
    /// missing parity stays missing.
    pub async fn recover<W>(&self, sink: &mut W, shards: &mut [Vec<u8>]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let k = self.slab.data_shards();
        if shards.len() != self.slab.shards.len() {
            return Err(CodecError::ShardCountMismatch {
                expected: self.slab.shards.len(),
                got: shards.len(),
            });
        }
        if let Some(bad) = shards
            .iter()
            .find(|s| !s.is_empty() && s.len() % LEAF_SIZE as usize != 0)
        {
            return Err(CodecError::UnalignedShard { got: bad.len() });
        }

        if shards[..k].iter().any(|s| s.is_empty()) {
            let present = shards.iter().filter(|s| !s.is_empty()).count();
            if present < k {
                return Err(CodecError::NotEnoughShards {
                    present,
                    required: k,
                });
            }
            let rs = ReedSolomon::new(k, self.slab.parity_shards())?;
            let mut slots: Vec<Option<Vec<u8>>> = shards
                .iter_mut()
                .map(|s| {
                    if s.is_empty() {
                        None
                    } else {
                        Some(std::mem::take(s))
                    }
                })
                .collect();
            rs.reconstruct_data(&mut slots)?;
            for (shard, slot) in shards.iter_mut().zip(slots) {
                if let Some(v) = slot {
                    *shard = v;
                }
            }
        }

        // join leaf rows across the data shards, skipping the slice offset
        // within the first chunk
        let chunk = LEAF_SIZE as usize * k;
        let leaf = LEAF_SIZE as usize;
        let mut skip = (self.offset as usize) % chunk;
        let mut remaining = self.length as usize;
        let rows = shards[0].len() / leaf;
        'rows: for row in 0..rows {
            for shard in shards[..k].iter() {
                if remaining == 0 {
                    break 'rows;
                }
                let piece = &shard[row * leaf..(row + 1) * leaf];
                if skip >= leaf {
                    skip -= leaf;
                    continue;
                }
                let take = (leaf - skip).min(remaining);
                sink.write_all(&piece[skip..skip + take])
                    .await
                    .map_err(|e| CodecError::Sink(e.to_string()))?;
                skip = 0;
                remaining -= take;
            }
        }
        if remaining > 0 {
            return Err(CodecError::Erasure(
                "shard region too short for slice".to_string(),
            ));
        }
        Ok(())
    }
}

/// Streaming decrypt wrapper around a caller-supplied sink.
///
/// Every byte written is XORed with the object keystream at its plaintext
/// position; partial inner writes advance the keystream by exactly the
/// accepted byte count, so short writes never desynchronize the stream.
pub struct CipherWriter<W> {
    inner: W,
    key: EncryptionKey,
    pos: u64,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CipherWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.scratch.clear();
        this.scratch.extend_from_slice(buf);
        this.key
            .apply(&[0u8; 24], this.pos, &mut this.scratch)
            .map_err(io::Error::other)?;
        match Pin::new(&mut this.inner).poll_write(cx, &this.scratch) {
            Poll::Ready(Ok(n)) => {
                this.pos += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
