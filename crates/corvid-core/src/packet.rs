//! Demuxed packets and the bounded inter-thread packet queue.
//!
//! One [`PacketQueue`] sits between the demuxer and each decoder worker.
//! The demuxer never blocks on push — back-pressure is applied one level
//! up, in the packet-reading loop — while workers sleep on the queue's
//! condition variable until a packet or a state-change wake arrives.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// One encoded, codec-specific chunk read from the container.
#[derive(Debug, Clone)]
pub struct DemuxPacket {
    /// Container-assigned stream index this packet belongs to.
    pub stream_index: usize,
    /// Presentation timestamp in milliseconds, when known.
    pub pts: Option<i64>,
    /// Decode timestamp in milliseconds, when known.
    pub dts: Option<i64>,
    /// Encoded payload. An empty payload is the end-of-stream drain
    /// packet that flushes delayed codecs.
    pub data: Vec<u8>,
}

impl DemuxPacket {
    /// The end-of-stream drain packet for a stream.
    pub fn empty(stream_index: usize) -> Self {
        Self {
            stream_index,
            pts: None,
            dts: None,
            data: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A queue element: either real data or the flush marker.
///
/// A worker that pops [`Packet::Flush`] resets its codec buffers and
/// forgets its PTS watermark before continuing.
#[derive(Debug)]
pub enum Packet {
    /// Marker instructing the consumer to reset codec state.
    Flush,
    /// A demuxed packet.
    Data(DemuxPacket),
}

impl Packet {
    fn accounted_size(&self) -> usize {
        match self {
            // The marker is accounted like a small packet so queue-size
            // arithmetic stays symmetric across push and pop.
            Packet::Flush => std::mem::size_of::<Packet>(),
            Packet::Data(pkt) => std::mem::size_of::<Packet>() + pkt.size(),
        }
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, Packet::Flush)
    }
}

#[derive(Default)]
struct QueueInner {
    packets: VecDeque<Packet>,
    size: usize,
    length: usize,
}

/// Bounded-accounting FIFO of packets between the demuxer and one worker.
///
/// Size and length are only mutated under the mutex; every push signals a
/// waiter, and `flush(true)` leaves exactly one flush marker in the queue
/// and wakes everyone.
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    wait: Condvar,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            wait: Condvar::new(),
        }
    }

    /// Appends a packet, taking ownership, and wakes one waiter.
    ///
    /// Never blocks on capacity.
    pub fn push(&self, packet: Packet) {
        {
            let mut inner = self.inner.lock();
            inner.size += packet.accounted_size();
            inner.length += 1;
            inner.packets.push_back(packet);
        }
        self.wait.notify_one();
    }

    /// Removes and returns the oldest packet, or `None` when empty.
    pub fn pop(&self) -> Option<Packet> {
        let mut inner = self.inner.lock();
        let packet = inner.packets.pop_front()?;
        inner.size -= packet.accounted_size();
        inner.length -= 1;
        Some(packet)
    }

    /// Drops every queued packet. With `insert_marker` a single flush
    /// marker is left behind and all waiters are woken; repeated flushes
    /// still leave exactly one marker.
    pub fn flush(&self, insert_marker: bool) {
        {
            let mut inner = self.inner.lock();
            inner.packets.clear();
            inner.size = 0;
            inner.length = 0;
            if insert_marker {
                let marker = Packet::Flush;
                inner.size += marker.accounted_size();
                inner.length += 1;
                inner.packets.push_back(marker);
            }
        }
        if insert_marker {
            self.wait.notify_all();
        }
    }

    /// Current queue payload in bytes.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Current queue length in packets.
    pub fn length(&self) -> usize {
        self.inner.lock().length
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Blocks until a packet is queued or the queue is woken, for at most
    /// `timeout`. Used by workers with nothing to do.
    pub fn wait_for_work(&self, timeout: std::time::Duration) {
        let mut inner = self.inner.lock();
        if inner.packets.is_empty() {
            self.wait.wait_for(&mut inner, timeout);
        }
    }

    /// Wakes every thread sleeping on the queue, typically after a state
    /// change the worker must observe.
    pub fn wake_all(&self) {
        self.wait.notify_all();
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn data_packet(stream_index: usize, bytes: usize) -> Packet {
        Packet::Data(DemuxPacket {
            stream_index,
            pts: Some(0),
            dts: Some(0),
            data: vec![0u8; bytes],
        })
    }

    #[test]
    fn test_push_pop_accounting() {
        let queue = PacketQueue::new();
        queue.push(data_packet(0, 100));
        queue.push(data_packet(0, 50));
        assert_eq!(queue.length(), 2);
        let expected = 150 + 2 * std::mem::size_of::<Packet>();
        assert_eq!(queue.size(), expected);

        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.length(), 0);
    }

    #[test]
    fn test_flush_drops_everything_and_inserts_one_marker() {
        let queue = PacketQueue::new();
        for _ in 0..10 {
            queue.push(data_packet(0, 64));
        }
        queue.flush(true);
        assert_eq!(queue.length(), 1);
        assert!(queue.pop().unwrap().is_flush());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_repeated_flush_is_idempotent() {
        let queue = PacketQueue::new();
        queue.push(data_packet(0, 64));
        queue.flush(true);
        queue.flush(true);
        queue.flush(true);
        assert_eq!(queue.length(), 1);
        assert!(queue.pop().unwrap().is_flush());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_flush_without_marker_empties_queue() {
        let queue = PacketQueue::new();
        queue.push(data_packet(0, 64));
        queue.push(data_packet(1, 64));
        queue.flush(false);
        assert!(queue.is_empty());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_ordering_preserved_across_marker() {
        let queue = PacketQueue::new();
        queue.push(data_packet(1, 8));
        queue.push(Packet::Flush);
        queue.push(data_packet(2, 8));

        match queue.pop().unwrap() {
            Packet::Data(pkt) => assert_eq!(pkt.stream_index, 1),
            Packet::Flush => panic!("expected data before the marker"),
        }
        assert!(queue.pop().unwrap().is_flush());
        match queue.pop().unwrap() {
            Packet::Data(pkt) => assert_eq!(pkt.stream_index, 2),
            Packet::Flush => panic!("expected data after the marker"),
        }
    }

    #[test]
    fn test_push_wakes_waiter() {
        let queue = Arc::new(PacketQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                queue.wait_for_work(Duration::from_secs(5));
                queue.pop()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.push(data_packet(3, 16));
        let popped = consumer.join().unwrap();
        assert!(popped.is_some());
    }
}
