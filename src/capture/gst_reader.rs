//! gst-launch pipeline that turns the UxPlay socket stream into raw RGB

use std::path::Path;

use super::frame::Geometry;
use super::process::{CommandSpec, StdoutMode};

pub const GST_LAUNCH_BIN: &str = "gst-launch-1.0";

/// Output caps: packed RGB at the matrix size and configured rate
pub fn raw_caps(geometry: Geometry, fps: u32) -> String {
    format!(
        "video/x-raw,format=RGB,width={},height={},framerate={}/1,pixel-aspect-ratio=1/1",
        geometry.width, geometry.height, fps
    )
}

/// Build the frame-producer command.
///
/// shmsrc reads the socket, the middle of the pipeline scales and paces to
/// the matrix, fdsink writes frames back-to-back on stdout.
pub fn command(socket_path: &Path, geometry: Geometry, fps: u32) -> CommandSpec {
    let pipeline = [
        vec![
            "shmsrc".to_string(),
            format!("socket-path={}", socket_path.display()),
            "is-live=true".into(),
            "do-timestamp=true".into(),
        ],
        vec!["queue".into()],
        vec!["videoconvert".into()],
        vec!["videoscale".into()],
        vec!["videorate".into()],
        vec![raw_caps(geometry, fps)],
        vec!["fdsink".into(), "fd=1".into(), "sync=false".into()],
    ];

    let mut spec = CommandSpec::new(GST_LAUNCH_BIN, StdoutMode::Piped).arg("-q");
    for (i, element) in pipeline.into_iter().enumerate() {
        if i > 0 {
            spec = spec.arg("!");
        }
        spec = spec.args(element);
    }
    spec
}
