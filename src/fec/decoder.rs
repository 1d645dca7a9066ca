//! Block decoder.

use std::time::Instant;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};
use crate::fec::{id_newer, FecParams, Shard, RX_WINDOW_SLOTS};

/// Counters observed on a decoder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
    /// Blocks completed and delivered
    pub completed_blocks: u64,
    /// Completed blocks that needed Reed-Solomon reconstruction
    pub recovered_blocks: u64,
    /// Blocks evicted from the window before completion
    pub lost_blocks: u64,
    /// Blocks that failed reconstruction despite enough shards
    pub unrecoverable_blocks: u64,
    /// Shards for already-delivered, duplicate or out-of-window positions
    pub stale_shards: u64,
}

struct Slot {
    block_id: u32,
    shards: Vec<Option<Vec<u8>>>,
    present: usize,
    shard_size: usize,
    completed: bool,
    first_seen: Instant,
}

enum SlotAction {
    Open,
    Store,
    Stale,
    Evict,
}

/// Reassembles shards into blocks inside a sliding window.
///
/// The window holds [`RX_WINDOW_SLOTS`] open blocks indexed by
/// `block-id mod W`. A newer block id evicts the slot's previous occupant;
/// an eviction before completion is accounted as loss. Completed blocks are
/// delivered at most once, in strictly ascending block-id order.
pub struct BlockDecoder {
    params: FecParams,
    rs: ReedSolomon,
    window: Vec<Option<Slot>>,
    highest_delivered: Option<u32>,
    stats: DecoderStats,
}

impl BlockDecoder {
    /// Create a decoder for the given geometry.
    pub fn new(params: FecParams) -> Result<Self> {
        let rs = ReedSolomon::new(params.data_shards, params.parity_shards)
            .map_err(|e| Error::config(format!("invalid FEC geometry: {:?}", e)))?;
        let mut window = Vec::with_capacity(RX_WINDOW_SLOTS);
        window.resize_with(RX_WINDOW_SLOTS, || None);
        Ok(Self {
            params,
            rs,
            window,
            highest_delivered: None,
            stats: DecoderStats::default(),
        })
    }

    /// Feed one received shard.
    ///
    /// Returns the reassembled block payload (exactly `D * shard_size`
    /// bytes, zero-padded tail) when this shard completes its block.
    /// Shards for closed, stale or already-delivered blocks are absorbed
    /// silently and counted.
    pub fn push(&mut self, shard: Shard) -> Result<Option<Vec<u8>>> {
        self.check_geometry(&shard)?;

        // Blocks at or below the delivery horizon are finished business.
        if let Some(highest) = self.highest_delivered {
            if !id_newer(shard.block_id, highest) {
                self.stats.stale_shards += 1;
                return Ok(None);
            }
        }

        let idx = shard.block_id as usize % RX_WINDOW_SLOTS;

        let action = match &self.window[idx] {
            None => SlotAction::Open,
            Some(slot) if slot.block_id == shard.block_id => {
                if slot.completed {
                    SlotAction::Stale
                } else {
                    SlotAction::Store
                }
            }
            Some(slot) if id_newer(shard.block_id, slot.block_id) => SlotAction::Evict,
            // Older than the slot's occupant: outside the window.
            Some(_) => SlotAction::Stale,
        };

        match action {
            SlotAction::Stale => {
                self.stats.stale_shards += 1;
                return Ok(None);
            }
            SlotAction::Evict => {
                let old = self.window[idx].take().expect("evicting a live slot");
                if !old.completed {
                    // Reported as loss, never propagated to the pipeline.
                    self.stats.lost_blocks += 1;
                    tracing::trace!(
                        block_id = old.block_id,
                        present = old.present,
                        age_ms = old.first_seen.elapsed().as_millis() as u64,
                        reason = %Error::FecIncomplete,
                        "block evicted before completion"
                    );
                }
                self.window[idx] = Some(Slot::open(&shard, self.params.total_shards()));
            }
            SlotAction::Open => {
                self.window[idx] = Some(Slot::open(&shard, self.params.total_shards()));
            }
            SlotAction::Store => {}
        }

        let slot = self.window[idx].as_mut().expect("slot populated above");

        if shard.data.len() != slot.shard_size {
            return Err(Error::parse(format!(
                "shard size {} differs from block's {}",
                shard.data.len(),
                slot.shard_size
            )));
        }
        if slot.shards[shard.index as usize].is_some() {
            // The sender emits each (block, index) exactly once.
            self.stats.stale_shards += 1;
            return Ok(None);
        }

        slot.shards[shard.index as usize] = Some(shard.data);
        slot.present += 1;

        if slot.present < self.params.data_shards {
            return Ok(None);
        }

        self.complete(idx)
    }

    /// Snapshot of decoder counters.
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    fn check_geometry(&self, shard: &Shard) -> Result<()> {
        if shard.total_data as usize != self.params.data_shards
            || shard.total_parity as usize != self.params.parity_shards
        {
            return Err(Error::parse(format!(
                "shard geometry {}+{} does not match configured {}+{}",
                shard.total_data,
                shard.total_parity,
                self.params.data_shards,
                self.params.parity_shards
            )));
        }
        if shard.index as usize >= self.params.total_shards() {
            return Err(Error::parse(format!(
                "shard index {} out of range",
                shard.index
            )));
        }
        if shard.data.is_empty() || shard.data.len() > self.params.max_shard_size {
            return Err(Error::parse(format!(
                "shard size {} outside (0, {}]",
                shard.data.len(),
                self.params.max_shard_size
            )));
        }
        Ok(())
    }

    fn complete(&mut self, idx: usize) -> Result<Option<Vec<u8>>> {
        let data_shards = self.params.data_shards;
        let slot = self.window[idx].as_mut().expect("completing a live slot");

        let needed_reconstruction = slot.shards[..data_shards].iter().any(|s| s.is_none());
        let mut shards = std::mem::take(&mut slot.shards);
        slot.completed = true;
        let block_id = slot.block_id;

        if let Err(e) = self.rs.reconstruct(&mut shards) {
            self.stats.unrecoverable_blocks += 1;
            tracing::warn!(block_id, error = ?e, "reconstruction failed");
            return Err(Error::FecUnrecoverable);
        }

        let mut payload = Vec::with_capacity(data_shards * shards[0].as_ref().map_or(0, |s| s.len()));
        for shard in shards.into_iter().take(data_shards) {
            payload.extend_from_slice(&shard.expect("reconstruct fills all shards"));
        }

        self.highest_delivered = Some(block_id);
        self.stats.completed_blocks += 1;
        if needed_reconstruction {
            self.stats.recovered_blocks += 1;
        }

        Ok(Some(payload))
    }
}

impl Slot {
    fn open(shard: &Shard, total: usize) -> Self {
        let mut shards = Vec::with_capacity(total);
        shards.resize_with(total, || None);
        Self {
            block_id: shard.block_id,
            shards,
            present: 0,
            shard_size: shard.data.len(),
            completed: false,
            first_seen: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::BlockEncoder;

    fn params(data: usize, parity: usize, shard: usize) -> FecParams {
        FecParams::new(data, parity, shard).unwrap()
    }

    fn encode_block(params: FecParams, payload: &[u8]) -> Vec<Shard> {
        let mut enc = BlockEncoder::new(params).unwrap();
        enc.push(payload).unwrap();
        enc.flush().unwrap()
    }

    fn padded(payload: &[u8], shards: &[Shard], data: usize) -> Vec<u8> {
        let mut expected = payload.to_vec();
        expected.resize(data * shards[0].data.len(), 0);
        expected
    }

    #[test]
    fn test_lossless_roundtrip() {
        let p = params(4, 2, 1024);
        let payload: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        let shards = encode_block(p, &payload);
        let expected = padded(&payload, &shards, 4);

        let mut dec = BlockDecoder::new(p).unwrap();
        let mut delivered = None;
        for shard in shards {
            if let Some(block) = dec.push(shard).unwrap() {
                delivered = Some(block);
            }
        }
        assert_eq!(delivered.unwrap(), expected);
        assert_eq!(dec.stats().recovered_blocks, 0);
    }

    #[test]
    fn test_recovers_up_to_parity_losses() {
        let p = params(8, 2, 128);
        let payload: Vec<u8> = (0..900).map(|i| (i * 7 % 256) as u8).collect();
        let shards = encode_block(p, &payload);
        let expected = padded(&payload, &shards, 8);

        // Drop two data shards; any 8 of 10 must suffice.
        let mut dec = BlockDecoder::new(p).unwrap();
        let mut delivered = None;
        for shard in shards.into_iter().filter(|s| s.index != 1 && s.index != 4) {
            if let Some(block) = dec.push(shard).unwrap() {
                delivered = Some(block);
            }
        }
        assert_eq!(delivered.unwrap(), expected);
        assert_eq!(dec.stats().recovered_blocks, 1);
    }

    #[test]
    fn test_burst_loss_of_consecutive_shards() {
        let p = params(8, 2, 64);
        let payload = vec![0x5A; 512];
        let shards = encode_block(p, &payload);

        let mut dec = BlockDecoder::new(p).unwrap();
        let mut delivered = None;
        for shard in shards.into_iter().filter(|s| s.index != 2 && s.index != 3) {
            if let Some(block) = dec.push(shard).unwrap() {
                delivered = Some(block);
            }
        }
        assert!(delivered.is_some());
    }

    #[test]
    fn test_too_many_losses_never_delivers() {
        let p = params(4, 2, 64);
        let shards = encode_block(p, &[0x11; 256]);

        // Only 3 of 6 shards arrive; block must not complete.
        let mut dec = BlockDecoder::new(p).unwrap();
        for shard in shards.into_iter().take(3) {
            assert!(dec.push(shard).unwrap().is_none());
        }
        assert_eq!(dec.stats().completed_blocks, 0);
    }

    #[test]
    fn test_completion_is_idempotent() {
        let p = params(2, 1, 64);
        let shards = encode_block(p, &[0x22; 100]);
        let spare = shards[2].clone();

        let mut dec = BlockDecoder::new(p).unwrap();
        let mut deliveries = 0;
        for shard in shards.into_iter().take(2) {
            if dec.push(shard).unwrap().is_some() {
                deliveries += 1;
            }
        }
        assert_eq!(deliveries, 1);

        // Late parity shard for the completed block is absorbed.
        assert!(dec.push(spare).unwrap().is_none());
        assert_eq!(dec.stats().stale_shards, 1);
    }

    #[test]
    fn test_duplicate_shard_ignored() {
        let p = params(4, 2, 64);
        let shards = encode_block(p, &[0x33; 200]);

        let mut dec = BlockDecoder::new(p).unwrap();
        let dup = shards[0].clone();
        dec.push(shards[0].clone()).unwrap();
        assert!(dec.push(dup).unwrap().is_none());
        assert_eq!(dec.stats().stale_shards, 1);
    }

    #[test]
    fn test_delivery_is_strictly_ascending() {
        let p = params(2, 1, 64);
        let mut enc = BlockEncoder::new(p).unwrap();

        let mut blocks = Vec::new();
        for i in 0u8..3 {
            enc.push(&[i; 100]).unwrap();
            blocks.push(enc.flush().unwrap());
        }

        let mut dec = BlockDecoder::new(p).unwrap();
        let mut delivered_ids = Vec::new();

        // Block 1 completes first, then block 0's shards straggle in,
        // then block 2.
        for shard in blocks.remove(1) {
            if dec.push(shard).unwrap().is_some() {
                delivered_ids.push(1u32);
            }
        }
        for shard in blocks.remove(0) {
            if dec.push(shard).unwrap().is_some() {
                delivered_ids.push(0u32);
            }
        }
        for shard in blocks.remove(0) {
            if dec.push(shard).unwrap().is_some() {
                delivered_ids.push(2u32);
            }
        }

        assert_eq!(delivered_ids, vec![1, 2]);
    }

    #[test]
    fn test_window_eviction_counts_loss() {
        let p = params(2, 1, 64);
        let mut dec = BlockDecoder::new(p).unwrap();
        let mut enc = BlockEncoder::new(p).unwrap();

        enc.push(&[0x44; 100]).unwrap();
        let early = enc.flush().unwrap();

        // One shard of block 0 arrives, then the window wraps past it.
        dec.push(early[0].clone()).unwrap();

        let mut far = None;
        for _ in 0..RX_WINDOW_SLOTS {
            enc.push(&[0x55; 100]).unwrap();
            far = enc.flush();
        }
        let far = far.unwrap();
        assert_eq!(far[0].block_id % RX_WINDOW_SLOTS as u32, 0);

        dec.push(far[0].clone()).unwrap();
        assert_eq!(dec.stats().lost_blocks, 1);
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let p = params(4, 2, 64);
        let mut dec = BlockDecoder::new(p).unwrap();

        let shard = Shard {
            block_id: 0,
            index: 0,
            total_data: 6,
            total_parity: 3,
            data: vec![0u8; 32],
        };
        assert!(dec.push(shard).is_err());
    }

    #[test]
    fn test_inconsistent_shard_size_rejected() {
        let p = params(4, 2, 64);
        let shards = encode_block(p, &[0x66; 200]);

        let mut dec = BlockDecoder::new(p).unwrap();
        dec.push(shards[0].clone()).unwrap();

        let mut bad = shards[1].clone();
        bad.data.push(0);
        assert!(dec.push(bad).is_err());
    }
}
