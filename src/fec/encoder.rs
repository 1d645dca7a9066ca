//! Block encoder.

use std::time::{Duration, Instant};

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};
use crate::fec::{FecParams, Shard};

/// Batches outgoing datagrams into FEC blocks.
///
/// Datagrams are appended whole; one datagram never straddles a block
/// boundary. A block is sealed when the next datagram would overflow it,
/// when it is exactly full, or when the flush timer expires on a partial
/// block.
pub struct BlockEncoder {
    params: FecParams,
    rs: ReedSolomon,
    pending: Vec<u8>,
    pending_since: Option<Instant>,
    next_block_id: u32,
}

impl BlockEncoder {
    /// Create an encoder for the given geometry.
    pub fn new(params: FecParams) -> Result<Self> {
        let rs = ReedSolomon::new(params.data_shards, params.parity_shards)
            .map_err(|e| Error::config(format!("invalid FEC geometry: {:?}", e)))?;
        Ok(Self {
            params,
            rs,
            pending: Vec::with_capacity(params.max_block_payload()),
            pending_since: None,
            next_block_id: 0,
        })
    }

    /// Append one datagram.
    ///
    /// Returns the sealed previous block when the datagram would have
    /// overflowed it.
    pub fn push(&mut self, datagram: &[u8]) -> Result<Option<Vec<Shard>>> {
        if datagram.len() > self.params.max_block_payload() {
            return Err(Error::parse(format!(
                "datagram of {} bytes exceeds block capacity {}",
                datagram.len(),
                self.params.max_block_payload()
            )));
        }

        let flushed = if !self.pending.is_empty()
            && self.pending.len() + datagram.len() > self.params.max_block_payload()
        {
            Some(self.seal_block())
        } else {
            None
        };

        if self.pending.is_empty() {
            self.pending_since = Some(Instant::now());
        }
        self.pending.extend_from_slice(datagram);
        Ok(flushed)
    }

    /// Seal the pending block, if any.
    pub fn flush(&mut self) -> Option<Vec<Shard>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.seal_block())
        }
    }

    /// Whether the pending block cannot take another byte.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.params.max_block_payload()
    }

    /// Whether a partial block has been pending longer than `max_age`.
    pub fn flush_due(&self, max_age: Duration) -> bool {
        self.pending_since
            .map(|since| since.elapsed() >= max_age)
            .unwrap_or(false)
    }

    /// Bytes currently buffered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn seal_block(&mut self) -> Vec<Shard> {
        debug_assert!(!self.pending.is_empty());

        let data = self.params.data_shards;
        let parity = self.params.parity_shards;
        let shard_size = self.pending.len().div_ceil(data).max(1);

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(data + parity);
        for chunk_start in (0..data * shard_size).step_by(shard_size) {
            let mut shard = vec![0u8; shard_size];
            if chunk_start < self.pending.len() {
                let end = (chunk_start + shard_size).min(self.pending.len());
                shard[..end - chunk_start].copy_from_slice(&self.pending[chunk_start..end]);
            }
            shards.push(shard);
        }
        shards.resize(data + parity, vec![0u8; shard_size]);

        // Geometry was validated at construction, so encode cannot fail.
        self.rs
            .encode(&mut shards)
            .expect("shard layout matches codec geometry");

        let block_id = self.next_block_id;
        self.next_block_id = self.next_block_id.wrapping_add(1);
        self.pending.clear();
        self.pending_since = None;

        shards
            .into_iter()
            .enumerate()
            .map(|(index, data_bytes)| Shard {
                block_id,
                index: index as u8,
                total_data: data as u8,
                total_parity: parity as u8,
                data: data_bytes,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(data: usize, parity: usize, shard: usize) -> FecParams {
        FecParams::new(data, parity, shard).unwrap()
    }

    #[test]
    fn test_push_batches_until_capacity() {
        let mut enc = BlockEncoder::new(params(4, 2, 100)).unwrap();

        // Three 100-byte datagrams fit inside one 400-byte block.
        for _ in 0..3 {
            assert!(enc.push(&[0xAB; 100]).unwrap().is_none());
        }
        assert_eq!(enc.pending_len(), 300);

        // A 200-byte datagram would overflow, sealing the current block.
        let block = enc.push(&[0xCD; 200]).unwrap().unwrap();
        assert_eq!(block.len(), 6);
        assert_eq!(enc.pending_len(), 200);
    }

    #[test]
    fn test_sealed_block_geometry() {
        let mut enc = BlockEncoder::new(params(4, 2, 256)).unwrap();
        enc.push(&[0x11; 700]).unwrap();
        let shards = enc.flush().unwrap();

        assert_eq!(shards.len(), 6);
        // 700 bytes over 4 data shards rounds up to 175 per shard.
        assert!(shards.iter().all(|s| s.data.len() == 175));
        assert!(shards.iter().all(|s| s.total_data == 4 && s.total_parity == 2));
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(shard.index as usize, i);
        }
    }

    #[test]
    fn test_block_ids_increment() {
        let mut enc = BlockEncoder::new(params(2, 1, 64)).unwrap();

        enc.push(b"one").unwrap();
        let a = enc.flush().unwrap();
        enc.push(b"two").unwrap();
        let b = enc.flush().unwrap();

        assert_eq!(a[0].block_id, 0);
        assert_eq!(b[0].block_id, 1);
    }

    #[test]
    fn test_flush_empty_is_none() {
        let mut enc = BlockEncoder::new(params(2, 1, 64)).unwrap();
        assert!(enc.flush().is_none());
    }

    #[test]
    fn test_flush_due_tracks_oldest_pending() {
        let mut enc = BlockEncoder::new(params(2, 1, 64)).unwrap();
        assert!(!enc.flush_due(Duration::ZERO));

        enc.push(b"partial").unwrap();
        assert!(enc.flush_due(Duration::ZERO));
        assert!(!enc.flush_due(Duration::from_secs(60)));

        enc.flush();
        assert!(!enc.flush_due(Duration::ZERO));
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let mut enc = BlockEncoder::new(params(2, 1, 64)).unwrap();
        assert!(enc.push(&[0u8; 129]).is_err());
    }

    #[test]
    fn test_exactly_full_block() {
        let mut enc = BlockEncoder::new(params(2, 1, 64)).unwrap();
        enc.push(&[0x7F; 128]).unwrap();
        assert!(enc.is_full());

        let shards = enc.flush().unwrap();
        assert_eq!(shards[0].data.len(), 64);
    }
}
