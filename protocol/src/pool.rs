//! # Frame Buffer Pool
//!
//! Three-tier pool of frame buffers for the marshal path. Tiers are sized
//! header + 4 KiB, header + 16 KiB and header + 64 KiB; `acquire_for` hands
//! out the smallest buffer that fits the payload.
//!
//! Frames leave the pool as frozen [`bytes::Bytes`]: the marshal path splits
//! the written frame off the pooled `BytesMut` and releases the remainder.
//! Once the last frame reference drops (after the socket write, or when an
//! overflowing queue discards it), `release` can reclaim the backing
//! allocation for reuse. Buffers whose capacity has degraded below the
//! smallest tier are discarded rather than pooled.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::codec::{HEADER_LEN, MAX_PAYLOAD};

/// Payload capacities of the three tiers.
const TIER_PAYLOAD: [usize; 3] = [4 * 1024, 16 * 1024, MAX_PAYLOAD];

/// Upper bound on idle buffers retained per tier.
const MAX_IDLE_PER_TIER: usize = 64;

struct Tier {
    /// Full buffer capacity for this tier (header included).
    capacity: usize,
    idle: Mutex<Vec<BytesMut>>,
}

/// Tiered pool of frame buffers.
pub struct BufferPool {
    tiers: [Tier; 3],
}

impl BufferPool {
    fn new() -> Self {
        let tier = |payload: usize| Tier {
            capacity: HEADER_LEN + payload,
            idle: Mutex::new(Vec::new()),
        };
        Self {
            tiers: [
                tier(TIER_PAYLOAD[0]),
                tier(TIER_PAYLOAD[1]),
                tier(TIER_PAYLOAD[2]),
            ],
        }
    }

    /// Returns an empty buffer from the smallest tier that can hold a frame
    /// with `payload_len` payload bytes. Requests beyond the largest tier get
    /// an exact-size allocation; the codec rejects those before marshalling.
    pub fn acquire_for(&self, payload_len: usize) -> BytesMut {
        let needed = HEADER_LEN + payload_len;
        for tier in &self.tiers {
            if tier.capacity >= needed {
                if let Some(buf) = tier.idle.lock().pop() {
                    return buf;
                }
                return BytesMut::with_capacity(tier.capacity);
            }
        }
        BytesMut::with_capacity(needed)
    }

    /// Returns a buffer to the tier matching its remaining capacity.
    ///
    /// Buffers below the smallest tier are discarded, so a poisoned or
    /// degraded buffer can never shrink the pool's guarantees.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        // Splitting frames off shrinks the visible capacity; once the frame
        // references are gone the original allocation can be reclaimed.
        // `try_reclaim` is all-or-nothing, so try the tiers largest first.
        for tier in self.tiers.iter().rev() {
            if buf.try_reclaim(tier.capacity) {
                break;
            }
        }
        let cap = buf.capacity();
        for tier in self.tiers.iter().rev() {
            if cap >= tier.capacity {
                let mut idle = tier.idle.lock();
                if idle.len() < MAX_IDLE_PER_TIER {
                    idle.push(buf);
                }
                return;
            }
        }
        // Below the smallest tier: drop.
    }

    #[cfg(test)]
    fn idle_counts(&self) -> [usize; 3] {
        [
            self.tiers[0].idle.lock().len(),
            self.tiers[1].idle.lock().len(),
            self.tiers[2].idle.lock().len(),
        ]
    }
}

static POOL: Lazy<BufferPool> = Lazy::new(BufferPool::new);

/// The process-wide frame buffer pool.
pub fn pool() -> &'static BufferPool {
    &POOL
}
