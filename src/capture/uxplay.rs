//! UxPlay AirPlay receiver invocation

use std::path::Path;

use tracing::warn;

use super::process::{CommandSpec, StdoutMode};

pub const UXPLAY_BIN: &str = "uxplay";

/// Size of the shared-memory segment backing the shmsink, in bytes
pub const SHM_SINK_SIZE: usize = 32 * 1024 * 1024;

/// GStreamer sink description handed to `uxplay -vs`.
///
/// UxPlay acts as the socket server; the frame reader connects later, so
/// the sink must not block waiting for it.
pub fn sink_description(socket_path: &Path) -> String {
    format!(
        "shmsink socket-path={} shm-size={} wait-for-connection=false sync=false",
        socket_path.display(),
        SHM_SINK_SIZE
    )
}

/// Build the capture-source command line.
///
/// `extra_args` comes straight from the user's config and is appended
/// verbatim after shell-word splitting.
pub fn command(airplay_name: &str, socket_path: &Path, extra_args: &str) -> CommandSpec {
    CommandSpec::new(UXPLAY_BIN, StdoutMode::Inherit)
        .arg("-n")
        .arg(airplay_name)
        .arg("-vs")
        .arg(sink_description(socket_path))
        .args(split_extra_args(extra_args))
}

pub fn split_extra_args(extra_args: &str) -> Vec<String> {
    let trimmed = extra_args.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    shlex::split(trimmed).unwrap_or_else(|| {
        warn!("Ignoring unparsable uxplay_extra_args: {:?}", extra_args);
        Vec::new()
    })
}
