//! Top-level control loop
//!
//! Negotiates the model, maps its overlay buffer, runs UxPlay and keeps a
//! frame reader alive behind it, pumping frames into the buffer until asked
//! to stop or something unrecoverable happens. Whatever the exit path, the
//! buffer is blanked and both children are stopped before `run` returns.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, trace, warn};

use crate::capture::{gst_reader, uxplay, CommandSpec, Geometry, ManagedProcess, ProcessKind};
use crate::overlay::buffer::SHM_DIR;
use crate::overlay::{negotiate, BufferOpenError, ControlApi, NegotiationError, OverlayBuffer};
use crate::pipeline::reassembler::Stats as ReassemblyStats;
use crate::pipeline::{transform, StreamReassembler};
use crate::{utils, Config, RetryPolicy, StopFlag};

/// Upper bound on a single read from the frame reader
pub const READ_CHUNK: usize = 64 * 1024;
/// Longest the loop blocks before re-checking the stop flag and children
pub const READ_WAIT: Duration = Duration::from_millis(500);
/// Pause after (re)starting the frame reader
pub const PRODUCER_SETTLE: Duration = Duration::from_millis(200);
/// Pause after the frame reader closed its output
pub const STREAM_CLOSED_SETTLE: Duration = Duration::from_millis(300);

pub const SOCKET_NAME: &str = "uxplay-video.sock";
const RUNTIME_SUBDIR: &str = "tmp/fpp-AirPlayMatrix";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{0} binary not found in PATH")]
    PrerequisiteMissing(String),
    #[error("runtime directory {}: {source}", .path.display())]
    RuntimeDir { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    BufferOpen(#[from] BufferOpenError),
    #[error("failed to start {kind}: {source}")]
    Spawn { kind: ProcessKind, source: io::Error },
    #[error("UxPlay exited with code {}", describe_code(.code))]
    CaptureSourceDied { code: Option<i32> },
}

impl SupervisorError {
    /// True when the run ended because a stop was requested mid-startup
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            SupervisorError::Negotiation(NegotiationError::Interrupted)
                | SupervisorError::BufferOpen(BufferOpenError::Interrupted)
        )
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "unknown".into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Negotiating,
    BufferOpening,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Init => "init",
            SupervisorState::Negotiating => "negotiating",
            SupervisorState::BufferOpening => "buffer-opening",
            SupervisorState::Running => "running",
            SupervisorState::Draining => "draining",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Builds the two child command lines
pub trait PipelineCommands {
    /// Executables that must resolve before anything is started
    fn prerequisites(&self) -> Vec<String>;

    fn capture_source(&self, socket_path: &Path) -> CommandSpec;

    fn frame_producer(&self, socket_path: &Path, geometry: Geometry) -> CommandSpec;
}

/// UxPlay into gst-launch, the production pipeline
#[derive(Debug, Clone)]
pub struct AirPlayCommands {
    pub airplay_name: String,
    pub extra_args: String,
    pub fps: u32,
}

impl AirPlayCommands {
    pub fn from_config(config: &Config) -> Self {
        Self {
            airplay_name: config.airplay_name.clone(),
            extra_args: config.uxplay_extra_args.clone(),
            fps: config.fps,
        }
    }
}

impl PipelineCommands for AirPlayCommands {
    fn prerequisites(&self) -> Vec<String> {
        vec![uxplay::UXPLAY_BIN.into(), gst_reader::GST_LAUNCH_BIN.into()]
    }

    fn capture_source(&self, socket_path: &Path) -> CommandSpec {
        uxplay::command(&self.airplay_name, socket_path, &self.extra_args)
    }

    fn frame_producer(&self, socket_path: &Path, geometry: Geometry) -> CommandSpec {
        gst_reader::command(socket_path, geometry, self.fps)
    }
}

/// Filesystem locations used during a run
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Where FPP's overlay objects live
    pub shm_dir: PathBuf,
    /// Scratch directory holding the UxPlay socket
    pub runtime_dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(media_dir: &Path) -> Self {
        Self {
            shm_dir: PathBuf::from(SHM_DIR),
            runtime_dir: media_dir.join(RUNTIME_SUBDIR),
        }
    }

    pub fn with_shm_dir(mut self, shm_dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = shm_dir.into();
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(SOCKET_NAME)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStats {
    pub frames_written: u64,
    pub bytes_read: u64,
    pub producer_starts: u64,
    pub producer_restarts: u64,
    /// Frame slicing over the whole run, across reader restarts
    pub reassembly: ReassemblyStats,
}

/// Everything acquired during a run; released exactly once by `teardown`.
#[derive(Default)]
struct Session {
    buffer: Option<OverlayBuffer>,
    capture: Option<ManagedProcess>,
    producer: Option<ManagedProcess>,
}

pub struct Supervisor<A, C> {
    config: Config,
    api: A,
    commands: C,
    paths: RuntimePaths,
    stop: StopFlag,
    negotiation: RetryPolicy,
    buffer_open: RetryPolicy,
    discovery_unit: Option<String>,
    state: SupervisorState,
    stats: SupervisorStats,
}

impl<A: ControlApi, C: PipelineCommands> Supervisor<A, C> {
    pub fn new(config: Config, api: A, commands: C, paths: RuntimePaths, stop: StopFlag) -> Self {
        Self {
            config,
            api,
            commands,
            paths,
            stop,
            negotiation: RetryPolicy::NEGOTIATION,
            buffer_open: RetryPolicy::BUFFER_OPEN,
            discovery_unit: Some(utils::DISCOVERY_UNIT.into()),
            state: SupervisorState::Init,
            stats: SupervisorStats::default(),
        }
    }

    pub fn with_retry_policies(mut self, negotiation: RetryPolicy, buffer_open: RetryPolicy) -> Self {
        self.negotiation = negotiation;
        self.buffer_open = buffer_open;
        self
    }

    /// `None` skips the mDNS responder check
    pub fn with_discovery_unit(mut self, unit: Option<String>) -> Self {
        self.discovery_unit = unit;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    /// Run to completion. `Ok` means a requested stop.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        let mut session = Session::default();

        let result = self.start_and_pump(&mut session).await;

        self.transition(SupervisorState::Draining);
        match &result {
            Ok(()) => info!("Stop requested"),
            Err(e) if e.is_interrupted() => info!("Stop requested during startup: {}", e),
            Err(e) => error!("Fatal error: {}", e),
        }
        self.teardown(session).await;
        self.transition(SupervisorState::Stopped);

        result
    }

    async fn start_and_pump(&mut self, session: &mut Session) -> Result<(), SupervisorError> {
        self.transition(SupervisorState::Init);
        self.check_prerequisites()?;
        if let Some(unit) = &self.discovery_unit {
            utils::check_discovery_service(unit).await;
        }

        fs::create_dir_all(&self.paths.runtime_dir).map_err(|source| SupervisorError::RuntimeDir {
            path: self.paths.runtime_dir.clone(),
            source,
        })?;
        self.remove_socket();

        self.transition(SupervisorState::Negotiating);
        info!("Preparing matrix model '{}'", self.config.model_name);
        let geometry = negotiate(&self.api, &self.config.model_name, self.negotiation, &self.stop).await?;
        info!("Matrix size: {}", geometry);

        self.transition(SupervisorState::BufferOpening);
        let mut buffer = OverlayBuffer::open(
            &self.paths.shm_dir,
            &self.config.model_name,
            geometry,
            self.buffer_open,
            &self.stop,
        )
        .await?;
        buffer.clear();
        session.buffer = Some(buffer);

        self.transition(SupervisorState::Running);
        let socket_path = self.paths.socket_path();
        let capture = ManagedProcess::start(
            ProcessKind::CaptureSource,
            &self.commands.capture_source(&socket_path),
        )
        .map_err(|source| SupervisorError::Spawn {
            kind: ProcessKind::CaptureSource,
            source,
        })?;
        session.capture = Some(capture);

        self.pump(session, geometry, &socket_path).await
    }

    /// The running state: keep the reader alive and move its frames into the buffer.
    async fn pump(
        &mut self,
        session: &mut Session,
        geometry: Geometry,
        socket_path: &Path,
    ) -> Result<(), SupervisorError> {
        let mut reassembler = StreamReassembler::new(geometry.frame_size());
        let mut chunk = vec![0u8; READ_CHUNK];

        while !self.stop.is_set() {
            if let Some(capture) = session.capture.as_mut() {
                if !capture.is_alive() {
                    return Err(SupervisorError::CaptureSourceDied {
                        code: capture.exit_code(),
                    });
                }
            }

            let producer_alive = session.producer.as_mut().map_or(false, |p| p.is_alive());
            if !producer_alive {
                if let Some(old) = session.producer.take() {
                    warn!(
                        "{} exited with code {}, restarting",
                        old.kind(),
                        describe_code(&old.exit_code())
                    );
                    old.stop().await;
                }
                session.producer = Some(self.start_producer(socket_path, geometry)?);
                reassembler.reset();
                self.stats.reassembly = reassembler.stats();
                tokio::time::sleep(PRODUCER_SETTLE).await;
            }

            let Some(stdout) = session.producer.as_mut().and_then(|p| p.stdout_mut()) else {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            };

            let read = match tokio::time::timeout(READ_WAIT, stdout.read(&mut chunk)).await {
                // nothing yet; loop round to re-check stop and liveness
                Err(_) => continue,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!("Frame reader read failed: {}", e);
                    0
                }
            };

            if read == 0 {
                info!("Frame reader stream closed, restarting");
                if let Some(producer) = session.producer.take() {
                    producer.stop().await;
                }
                reassembler.reset();
                self.stats.reassembly = reassembler.stats();
                tokio::time::sleep(STREAM_CLOSED_SETTLE).await;
                continue;
            }

            self.stats.bytes_read += read as u64;
            let Some(buffer) = session.buffer.as_mut() else {
                continue;
            };
            for frame in reassembler.feed(&chunk[..read]) {
                trace!("Writing frame {}", frame.sequence);
                let data = transform(
                    frame.data,
                    geometry.width,
                    geometry.height,
                    self.config.flip_x,
                    self.config.flip_y,
                );
                buffer.write_frame(&data);
                buffer.set_dirty();
                self.stats.frames_written += 1;
                metrics::counter!("overlay_frames_written").increment(1);
            }
            self.stats.reassembly = reassembler.stats();
        }

        Ok(())
    }

    fn start_producer(&mut self, socket_path: &Path, geometry: Geometry) -> Result<ManagedProcess, SupervisorError> {
        let spec = self.commands.frame_producer(socket_path, geometry);
        let producer = ManagedProcess::start(ProcessKind::FrameProducer, &spec).map_err(|source| {
            SupervisorError::Spawn {
                kind: ProcessKind::FrameProducer,
                source,
            }
        })?;

        if self.stats.producer_starts > 0 {
            self.stats.producer_restarts += 1;
            metrics::counter!("frame_producer_restarts").increment(1);
        }
        self.stats.producer_starts += 1;
        Ok(producer)
    }

    fn check_prerequisites(&self) -> Result<(), SupervisorError> {
        for binary in self.commands.prerequisites() {
            match utils::find_in_path(&binary) {
                Some(path) => debug!("Found {} at {}", binary, path.display()),
                None => return Err(SupervisorError::PrerequisiteMissing(binary)),
            }
        }
        Ok(())
    }

    /// Release everything in `session`. Each step logs its own failure and
    /// carries on.
    async fn teardown(&mut self, session: Session) {
        let Session {
            buffer,
            capture,
            producer,
        } = session;

        if let Some(mut buffer) = buffer {
            buffer.clear();
            buffer.close();
        }
        // reader first, it is a client of UxPlay's socket
        if let Some(producer) = producer {
            producer.stop().await;
        }
        if let Some(capture) = capture {
            capture.stop().await;
        }
        self.remove_socket();

        let stats = &self.stats;
        info!(
            "Wrote {} frames ({} bytes read, {} reader restarts)",
            stats.frames_written, stats.bytes_read, stats.producer_restarts
        );
        info!(
            "Reassembled {} frames, discarded {} partial-frame bytes over {} resets",
            stats.reassembly.frames_emitted, stats.reassembly.bytes_discarded, stats.reassembly.resets
        );
    }

    fn remove_socket(&self) {
        let socket_path = self.paths.socket_path();
        match fs::remove_file(&socket_path) {
            Ok(()) => debug!("Removed {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Unable to remove {}: {}", socket_path.display(), e),
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            info!("State {} -> {}", self.state, next);
        }
        self.state = next;
    }
}
