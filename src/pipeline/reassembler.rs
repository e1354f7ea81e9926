//! Reassembles fixed-size frames from an unframed byte stream

use bytes::BytesMut;

use crate::capture::Frame;

/// FIFO frame slicer for the raw pixel stream.
///
/// The stream carries no markers, so alignment is purely positional: the
/// first `frame_size` bytes after a (re)start are frame 0. After every
/// `feed` fewer than `frame_size` bytes remain pending.
pub struct StreamReassembler {
    frame_size: usize,
    pending: BytesMut,
    sequence: u64,
    stats: Stats,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub frames_emitted: u64,
    pub bytes_discarded: u64,
    pub resets: u64,
}

impl StreamReassembler {
    pub fn new(frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame size must be positive");
        Self {
            frame_size,
            pending: BytesMut::with_capacity(frame_size * 2),
            sequence: 0,
            stats: Stats::default(),
        }
    }

    /// Append `chunk` and return every frame it completes, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_size);
        while self.pending.len() >= self.frame_size {
            // split_to only moves the view start, no memmove of the tail
            let data = self.pending.split_to(self.frame_size).freeze();
            self.sequence += 1;
            frames.push(Frame {
                data,
                sequence: self.sequence,
            });
        }

        self.stats.frames_emitted += frames.len() as u64;
        frames
    }

    /// Drop any partial frame. Call whenever the producer restarts.
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("Discarding {} bytes of partial frame", self.pending.len());
        }
        self.stats.bytes_discarded += self.pending.len() as u64;
        self.stats.resets += 1;
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}
