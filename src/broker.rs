use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub const BROADCAST_CAPACITY: usize = 256;

/// Bytes of recent output replayed to a client when it attaches.
pub const REPLAY_CAPACITY: usize = 64 * 1024;

/// Fans PTY output out to attached sockets.
///
/// Keeps a bounded tail of recent output so a client that attaches late (or
/// resumes after a reconnect) sees what the shell printed while nobody was
/// listening. Publishing and subscribing share one lock, so the replay and the
/// live stream never overlap or leave a gap.
pub struct Broker {
    tx: broadcast::Sender<Bytes>,
    replay: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl Broker {
    pub fn new() -> Self {
        Self::with_replay_capacity(REPLAY_CAPACITY)
    }

    pub fn with_replay_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            replay: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    pub fn publish(&self, data: Bytes) {
        let mut replay = self.replay.lock();
        replay.extend(data.iter().copied());
        let overflow = replay.len().saturating_sub(self.capacity);
        replay.drain(..overflow);
        // No receivers is fine; the replay buffer still has it.
        let _ = self.tx.send(data);
    }

    /// Subscribe to live output, returning everything buffered so far.
    pub fn subscribe(&self) -> (Bytes, broadcast::Receiver<Bytes>) {
        let replay = self.replay.lock();
        let (front, back) = replay.as_slices();
        let mut snapshot = Vec::with_capacity(replay.len());
        snapshot.extend_from_slice(front);
        snapshot.extend_from_slice(back);
        (Bytes::from(snapshot), self.tx.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
