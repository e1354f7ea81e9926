//! FPP model overlay buffer
//!
//! FPP owns a shared-memory object per overlay model, laid out as:
//!
//! | offset | size         | field                                   |
//! |--------|--------------|-----------------------------------------|
//! | 0      | 4            | width, little-endian                    |
//! | 4      | 4            | height, little-endian                   |
//! | 8      | 4            | flags, bit 0 = frame dirty              |
//! | 12     | w * h * 3    | RGB24 payload, row-major                |
//!
//! We only map it. FPP creates and sizes it when the model is switched to
//! mmap mode, and it clears the dirty bit once it has presented a frame.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::capture::Geometry;
use crate::{retry, RetryError, RetryPolicy, StopFlag};

pub const HEADER_SIZE: usize = 12;
pub const FLAG_DIRTY: u32 = 0x1;

pub const SHM_DIR: &str = "/dev/shm";
const SHM_PREFIX: &str = "FPP-Model-Overlay-Buffer-";

const WIDTH_OFFSET: usize = 0;
const HEIGHT_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 8;

/// Shared-memory object name for a model; FPP swaps '/' for '_'.
pub fn shm_name(model: &str) -> String {
    format!("{}{}", SHM_PREFIX, model.replace('/', "_"))
}

pub fn shm_path(shm_dir: &Path, model: &str) -> PathBuf {
    shm_dir.join(shm_name(model))
}

/// Why a single open attempt was rejected
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("overlay buffer too small: {actual} bytes, need {expected}")]
    TooSmall { actual: u64, expected: u64 },
    #[error("overlay header mismatch. expected={expected} actual={actual_width}x{actual_height}")]
    HeaderMismatch {
        expected: Geometry,
        actual_width: u32,
        actual_height: u32,
    },
}

#[derive(Debug, Error)]
pub enum BufferOpenError {
    #[error("interrupted while opening overlay buffer")]
    Interrupted,
    #[error("unable to open overlay mmap {} after {attempts} attempts: {last}", .path.display())]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        last: AttemptError,
    },
}

/// Live mapping of one model's overlay buffer.
pub struct OverlayBuffer {
    mmap: MmapMut,
    geometry: Geometry,
    path: PathBuf,
}

impl OverlayBuffer {
    /// Map the model's buffer, retrying until its header reports `geometry`.
    ///
    /// The header can lag behind the API call that switched the model to
    /// mmap mode, so a mismatch is retried rather than treated as fatal.
    #[instrument(skip(shm_dir, policy, stop))]
    pub async fn open(
        shm_dir: &Path,
        model: &str,
        geometry: Geometry,
        policy: RetryPolicy,
        stop: &StopFlag,
    ) -> Result<Self, BufferOpenError> {
        let path = shm_path(shm_dir, model);
        let target = path.as_path();

        let buffer = retry(policy, stop, |_| async move { Self::try_open(target, geometry) })
            .await
            .map_err(|e| match e {
                RetryError::Interrupted => BufferOpenError::Interrupted,
                RetryError::Exhausted { attempts, last } => BufferOpenError::Exhausted {
                    path: path.clone(),
                    attempts,
                    last,
                },
            })?;

        info!("Mapped overlay buffer {} ({})", buffer.path.display(), geometry);
        Ok(buffer)
    }

    fn try_open(path: &Path, geometry: Geometry) -> Result<Self, AttemptError> {
        let size = HEADER_SIZE + geometry.frame_size();

        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // Touching a mapping past the end of the object raises SIGBUS
        let actual = file.metadata()?.len();
        if actual < size as u64 {
            return Err(AttemptError::TooSmall {
                actual,
                expected: size as u64,
            });
        }

        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        let buffer = Self {
            mmap,
            geometry,
            path: path.to_path_buf(),
        };

        let (actual_width, actual_height) = buffer.header_geometry();
        if actual_width != geometry.width || actual_height != geometry.height {
            // dropping `buffer` unmaps
            return Err(AttemptError::HeaderMismatch {
                expected: geometry,
                actual_width,
                actual_height,
            });
        }

        Ok(buffer)
    }

    pub fn frame_size(&self) -> usize {
        self.geometry.frame_size()
    }

    /// Dimensions as currently reported by the header
    pub fn header_geometry(&self) -> (u32, u32) {
        (self.read_u32(WIDTH_OFFSET), self.read_u32(HEIGHT_OFFSET))
    }

    pub fn flags(&self) -> u32 {
        self.read_u32(FLAGS_OFFSET)
    }

    #[cfg(test)]
    fn payload(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..HEADER_SIZE + self.frame_size()]
    }

    /// Copy one full frame into the payload region.
    ///
    /// # Panics
    ///
    /// If `frame` is not exactly `frame_size()` bytes; partial frames would
    /// leave the consumer with a mix of two images.
    pub fn write_frame(&mut self, frame: &[u8]) {
        let frame_size = self.frame_size();
        assert_eq!(
            frame.len(),
            frame_size,
            "frame must be exactly {} bytes",
            frame_size
        );
        self.mmap[HEADER_SIZE..HEADER_SIZE + frame_size].copy_from_slice(frame);
    }

    /// OR the dirty bit into the flags word, keeping any other bits.
    pub fn set_dirty(&mut self) {
        let flags = self.flags() | FLAG_DIRTY;
        self.mmap[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&flags.to_le_bytes());
    }

    /// Blank the payload and mark it dirty so FPP presents the blank frame.
    pub fn clear(&mut self) {
        let frame_size = self.frame_size();
        self.mmap[HEADER_SIZE..HEADER_SIZE + frame_size].fill(0);
        self.set_dirty();
    }

    pub fn close(self) {
        debug!("Unmapping overlay buffer {}", self.path.display());
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.mmap[offset..offset + 4]);
        u32::from_le_bytes(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Lay out an overlay object the way FPP would
    fn create_overlay(dir: &Path, model: &str, width: u32, height: u32, flags: u32) -> PathBuf {
        let path = shm_path(dir, model);
        let mut data = Vec::new();
        data.extend_from_slice(&width.to_le_bytes());
        data.extend_from_slice(&height.to_le_bytes());
        data.extend_from_slice(&flags.to_le_bytes());
        data.resize(HEADER_SIZE + (width * height * 3) as usize, 0xAA);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn shm_name_replaces_slashes() {
        assert_eq!(shm_name("Matrix"), "FPP-Model-Overlay-Buffer-Matrix");
        assert_eq!(shm_name("Yard/Tree/Top"), "FPP-Model-Overlay-Buffer-Yard_Tree_Top");
    }

    #[tokio::test(start_paused = true)]
    async fn opens_matching_buffer() {
        let dir = tempfile::tempdir().unwrap();
        create_overlay(dir.path(), "Matrix", 4, 2, 0);
        let g = Geometry::new(4, 2).unwrap();

        let buf = OverlayBuffer::open(dir.path(), "Matrix", g, RetryPolicy::BUFFER_OPEN, &StopFlag::new())
            .await
            .unwrap();
        assert_eq!(buf.header_geometry(), (4, 2));
        assert_eq!(buf.payload().len(), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn header_mismatch_exhausts_retries_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        // same frame size, wrong shape
        let path = create_overlay(dir.path(), "Matrix", 640, 1, 0);
        let before = fs::read(&path).unwrap();
        let g = Geometry::new(64, 10).unwrap();

        let start = tokio::time::Instant::now();
        let err = OverlayBuffer::open(dir.path(), "Matrix", g, RetryPolicy::BUFFER_OPEN, &StopFlag::new())
            .await
            .err()
            .unwrap();

        match &err {
            BufferOpenError::Exhausted { attempts, last, .. } => {
                assert_eq!(*attempts, 40);
                assert!(matches!(
                    last,
                    AttemptError::HeaderMismatch {
                        actual_width: 640,
                        actual_height: 1,
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        let msg = err.to_string();
        assert!(msg.contains("expected=64x10"), "{}", msg);
        assert!(msg.contains("actual=640x1"), "{}", msg);
        // 39 gaps between 40 attempts
        assert!(start.elapsed() >= RetryPolicy::BUFFER_OPEN.delay * 39);
        assert!(start.elapsed() < RetryPolicy::BUFFER_OPEN.delay * 40);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn short_object_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = shm_path(dir.path(), "Matrix");
        fs::write(&path, [0u8; 8]).unwrap();
        let g = Geometry::new(4, 2).unwrap();
        let policy = RetryPolicy {
            attempts: 2,
            delay: RetryPolicy::BUFFER_OPEN.delay,
        };

        let err = OverlayBuffer::open(dir.path(), "Matrix", g, policy, &StopFlag::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BufferOpenError::Exhausted {
                last: AttemptError::TooSmall { actual: 8, expected: 36 },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_open() {
        let dir = tempfile::tempdir().unwrap();
        let stop = StopFlag::new();
        stop.set();
        let g = Geometry::new(4, 2).unwrap();
        let err = OverlayBuffer::open(dir.path(), "Matrix", g, RetryPolicy::BUFFER_OPEN, &stop)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BufferOpenError::Interrupted));
    }

    #[tokio::test]
    async fn write_then_set_dirty_preserves_other_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = create_overlay(dir.path(), "Matrix", 2, 2, 0b0000_0110);
        let g = Geometry::new(2, 2).unwrap();
        let mut buf = OverlayBuffer::open(dir.path(), "Matrix", g, RetryPolicy::BUFFER_OPEN, &StopFlag::new())
            .await
            .unwrap();

        let frame: Vec<u8> = (1..=12).collect();
        buf.write_frame(&frame);
        buf.set_dirty();
        assert_eq!(buf.flags(), 0b0000_0111);
        assert_eq!(buf.payload(), &frame[..]);
        buf.close();

        let raw = fs::read(&path).unwrap();
        assert_eq!(&raw[8..12], &[0b0000_0111, 0, 0, 0]);
        assert_eq!(&raw[12..], &frame[..]);
    }

    #[tokio::test]
    async fn clear_zeroes_payload_and_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        create_overlay(dir.path(), "Matrix", 3, 2, 0x100);
        let g = Geometry::new(3, 2).unwrap();
        let mut buf = OverlayBuffer::open(dir.path(), "Matrix", g, RetryPolicy::BUFFER_OPEN, &StopFlag::new())
            .await
            .unwrap();

        buf.clear();
        assert!(buf.payload().iter().all(|&b| b == 0));
        assert_eq!(buf.flags(), 0x101);
        assert_eq!(buf.header_geometry(), (3, 2));
    }

    #[tokio::test]
    #[should_panic(expected = "frame must be exactly")]
    async fn partial_frame_is_a_contract_violation() {
        let dir = tempfile::tempdir().unwrap();
        create_overlay(dir.path(), "Matrix", 2, 2, 0);
        let g = Geometry::new(2, 2).unwrap();
        let mut buf = OverlayBuffer::open(dir.path(), "Matrix", g, RetryPolicy::BUFFER_OPEN, &StopFlag::new())
            .await
            .unwrap();
        buf.write_frame(&[0u8; 5]);
    }
}
