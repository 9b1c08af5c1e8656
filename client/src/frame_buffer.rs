use mrz_scanner_common::frame::Frame;
use std::sync::Mutex;

/// Single-slot holder for the most recent frame.
///
/// The capture loop overwrites the slot on every frame and the recognition
/// client takes snapshots. There is no queue and no backpressure onto the
/// camera. The slot holds whole frames, so a snapshot is always complete.
pub struct FrameBuffer {
    slot: Mutex<Option<Frame>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn store(&self, frame: Frame) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
    }

    pub fn snapshot(&self) -> Option<Frame> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn latest_seq(&self) -> Option<u64> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|f| f.seq)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_until_first_store() {
        let buffer = FrameBuffer::new();
        assert!(buffer.snapshot().is_none());
        assert!(buffer.latest_seq().is_none());
    }

    #[test]
    fn last_write_wins() {
        let buffer = FrameBuffer::new();
        buffer.store(Frame::new(vec![1], 10, 1));
        buffer.store(Frame::new(vec![2, 2], 20, 2));
        let frame = buffer.snapshot().unwrap();
        assert_eq!(frame.seq, 2);
        assert_eq!(frame.jpeg.as_ref(), &[2, 2]);
    }

    #[test]
    fn snapshot_survives_overwrite() {
        let buffer = FrameBuffer::new();
        buffer.store(Frame::new(vec![1, 1, 1], 10, 1));
        let held = buffer.snapshot().unwrap();
        buffer.store(Frame::new(vec![9], 20, 2));
        assert_eq!(held.jpeg.as_ref(), &[1, 1, 1]);
        assert_eq!(buffer.latest_seq(), Some(2));
    }

    #[test]
    fn concurrent_readers_see_whole_frames() {
        let buffer = Arc::new(FrameBuffer::new());
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for seq in 0..2_000u64 {
                    let len = (seq % 64 + 1) as usize;
                    buffer.store(Frame::new(vec![seq as u8; len], 0, seq));
                }
            })
        };
        for _ in 0..2_000 {
            if let Some(frame) = buffer.snapshot() {
                let len = (frame.seq % 64 + 1) as usize;
                assert_eq!(frame.jpeg.len(), len);
                assert!(frame.jpeg.iter().all(|&b| b == frame.seq as u8));
            }
        }
        writer.join().unwrap();
    }
}
