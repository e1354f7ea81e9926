use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::unistd::{access, AccessFlags};
use tokio::process::Command;
use tracing::{debug, warn};

/// Service whose absence makes the AirPlay target undiscoverable
pub const DISCOVERY_UNIT: &str = "avahi-daemon";
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve an executable the way a shell would.
///
/// Names containing a '/' are checked as given; bare names are searched
/// for along `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        return is_executable(path).then(|| path.to_path_buf());
    }

    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

/// Warn if the mDNS responder is not running. Never fails.
pub async fn check_discovery_service(unit: &str) {
    let probe = Command::new("systemctl")
        .args(["is-active", unit])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(DISCOVERY_TIMEOUT, probe).await {
        Ok(Ok(output)) => {
            let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if state == "active" {
                debug!("{} is active", unit);
            } else {
                warn!("{} is not active; AirPlay target may not be discoverable.", unit);
            }
        }
        Ok(Err(e)) => warn!("Unable to check {} state: {}", unit, e),
        Err(_) => warn!("Unable to check {} state: timed out", unit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn absolute_paths_are_checked_directly() {
        assert_eq!(find_in_path("/bin/sh"), Some(PathBuf::from("/bin/sh")));
        assert_eq!(find_in_path("/nonexistent/uxplay"), None);
    }

    #[test]
    fn bare_names_need_execute_permission() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        fs::write(&plain, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&plain, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!is_executable(&plain));

        fs::set_permissions(&plain, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&plain));
        assert!(!is_executable(dir.path()));
    }

    #[test]
    fn sh_is_on_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-name").is_none());
    }
}
