//! Cross-process rendezvous over the sync block.
//!
//! Each named buffer carries one publish sequence. The writer brackets its
//! payload write with two increments (odd while writing, even once
//! published); the reader waits for an even sequence it has not consumed
//! yet. Because region ownership alternates strictly between the two
//! processes each timestep, these sequences are the sole arbiter — there is
//! no lock to contend on.
//!
//! Waiting backs off from spinning to yielding to sleeping, and always
//! observes the closed flag so a peer blocked mid-wait unblocks with
//! `ChannelClosed` when the other side tears down instead of hanging.

use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use crate::error::{ChannelError, Result};
use crate::layout::{BufferKind, SyncBlock};

/// Outcome of a successful [`SyncBlock::wait_publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A new publish was observed at this sequence.
    Published(u64),
    /// The owner reallocated the channel mid-wait; sequences were reset and
    /// the caller must refresh its layout before waiting again.
    Reallocated,
}

/// Iterations of busy-spinning before backing off to yields.
const SPIN_ROUNDS: u32 = 1 << 10;
/// Iterations of yielding before backing off to sleeps.
const YIELD_ROUNDS: u32 = 1 << 12;
/// Sleep interval once both backoff stages are exhausted.
const SLEEP_INTERVAL: Duration = Duration::from_micros(50);
/// Yield rounds granted to a mid-flight header install before giving up.
const GENERATION_SETTLE_ROUNDS: u32 = 1 << 16;

impl SyncBlock {
    /// Mark a write on the named buffer as in progress (sequence goes odd).
    pub fn begin_write(&self, kind: BufferKind) {
        let prev = self.seqs[kind.index()].fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev & 1 == 0, "concurrent write on {kind} buffer");
        fence(Ordering::Release);
    }

    /// Publish the named buffer (sequence goes even, readers may proceed).
    pub fn publish(&self, kind: BufferKind) {
        fence(Ordering::Release);
        self.seqs[kind.index()].fetch_add(1, Ordering::Release);
    }

    /// Current sequence of the named buffer.
    #[inline]
    pub fn sequence(&self, kind: BufferKind) -> u64 {
        self.seqs[kind.index()].load(Ordering::Acquire)
    }

    /// Whether either side has torn down.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) != 0
    }

    /// Raise the closed flag, waking any peer blocked in a wait.
    pub fn close(&self) {
        self.closed.store(1, Ordering::Release);
    }

    /// Current reallocation generation. Zero means a header install is
    /// mid-flight.
    #[inline]
    pub fn load_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Wait for a header install to finish, returning the settled (nonzero)
    /// generation. Bounded: a header that never settles is reported as
    /// invalid rather than spun on forever.
    pub fn settled_generation(&self) -> Result<u64> {
        for _ in 0..GENERATION_SETTLE_ROUNDS {
            let generation = self.load_generation();
            if generation != 0 {
                return Ok(generation);
            }
            std::thread::yield_now();
        }
        Err(ChannelError::InvalidHeader {
            message: "header install never completed",
        })
    }

    /// Block until the named buffer carries a publish newer than
    /// `last_seen`, the owner reallocates, the channel closes, or the
    /// timeout elapses.
    ///
    /// On a publish, returns the observed sequence; the caller re-checks it
    /// after copying the payload out and retries on a mismatch. On a
    /// reallocation (the header's generation moves away from `generation`,
    /// resetting every sequence), the caller must refresh its layout and
    /// restart the wait.
    pub fn wait_publish(
        &self,
        kind: BufferKind,
        generation: u64,
        last_seen: u64,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome> {
        let start = Instant::now();
        let mut rounds = 0u32;
        loop {
            if self.load_generation() != generation {
                return Ok(WaitOutcome::Reallocated);
            }

            // A publish that landed before a teardown is still delivered;
            // the closed flag only fails waits that would otherwise hang.
            let seq = self.sequence(kind);
            if seq & 1 == 0 && seq != last_seen {
                fence(Ordering::Acquire);
                return Ok(WaitOutcome::Published(seq));
            }

            if self.is_closed() {
                return Err(ChannelError::ChannelClosed);
            }

            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return Err(ChannelError::Timeout {
                        buffer: kind,
                        waited_ms: limit.as_millis() as u64,
                    });
                }
            }

            if rounds < SPIN_ROUNDS {
                core::hint::spin_loop();
                rounds += 1;
            } else if rounds < YIELD_ROUNDS {
                std::thread::yield_now();
                rounds += 1;
            } else {
                std::thread::sleep(SLEEP_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ForceMode, Precision};

    fn block() -> SyncBlock {
        SyncBlock::new(8, 2, Precision::Single, ForceMode::Add, 1)
    }

    #[test]
    fn test_publish_sequence_parity() {
        let sync = block();
        assert_eq!(sync.sequence(BufferKind::Positions), 0);

        sync.begin_write(BufferKind::Positions);
        assert_eq!(sync.sequence(BufferKind::Positions), 1);

        sync.publish(BufferKind::Positions);
        assert_eq!(sync.sequence(BufferKind::Positions), 2);

        // Other buffers are untouched.
        assert_eq!(sync.sequence(BufferKind::Forces), 0);
    }

    #[test]
    fn test_wait_returns_published() {
        let sync = block();
        sync.begin_write(BufferKind::Forces);
        sync.publish(BufferKind::Forces);

        let outcome = sync
            .wait_publish(BufferKind::Forces, 1, 0, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Published(2));
    }

    #[test]
    fn test_wait_times_out_without_publish() {
        let sync = block();
        let result = sync.wait_publish(
            BufferKind::Forces,
            1,
            0,
            Some(Duration::from_millis(5)),
        );
        assert!(matches!(result, Err(ChannelError::Timeout { .. })));
    }

    #[test]
    fn test_wait_ignores_consumed_publish() {
        let sync = block();
        sync.begin_write(BufferKind::Virial);
        sync.publish(BufferKind::Virial);

        // Sequence 2 already consumed: the wait must not return it again.
        let result = sync.wait_publish(
            BufferKind::Virial,
            1,
            2,
            Some(Duration::from_millis(5)),
        );
        assert!(matches!(result, Err(ChannelError::Timeout { .. })));
    }

    #[test]
    fn test_wait_observes_reallocation() {
        let sync = block();
        // Waiter armed against generation 1; the header moving on means the
        // sequences were reset and the wait must hand control back.
        sync.generation.store(2, std::sync::atomic::Ordering::Release);
        let outcome = sync
            .wait_publish(BufferKind::Forces, 1, 0, None)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Reallocated);
    }

    #[test]
    fn test_close_unblocks_waiter() {
        let sync = block();
        sync.close();
        let result = sync.wait_publish(BufferKind::Forces, 1, 0, None);
        assert!(matches!(result, Err(ChannelError::ChannelClosed)));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        use std::sync::Arc;

        let sync = Arc::new(block());
        let waiter = {
            let sync = Arc::clone(&sync);
            std::thread::spawn(move || {
                sync.wait_publish(BufferKind::Forces, 1, 0, Some(Duration::from_secs(5)))
            })
        };

        std::thread::sleep(Duration::from_millis(10));
        sync.begin_write(BufferKind::Forces);
        sync.publish(BufferKind::Forces);

        let outcome = waiter.join().expect("waiter panicked").unwrap();
        assert_eq!(outcome, WaitOutcome::Published(2));
    }
}
