//! Network link supervision.
//!
//! Association (SSID, passphrase, DHCP) is owned by the OS supplicant; the
//! node only watches the interface state and, when the link is gone,
//! restarts so association runs again from a clean state.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{sleep, Instant};

/// Exit status used when handing the restart to a process supervisor.
pub const RESTART_EXIT_CODE: i32 = 75;

/// How often `wait_for_link` re-checks the interface.
const LINK_POLL: Duration = Duration::from_millis(500);

/// Connection-status query plus the restart escape hatch.
pub trait Connectivity {
    fn is_connected(&self) -> bool;

    /// Restart the device.  Production implementations do not return.
    fn restart(&mut self, reason: &str);
}

/// What "restart" means on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Exit with [`RESTART_EXIT_CODE`] and let systemd bring us back.
    #[default]
    Exit,
    /// Reboot the whole machine.
    Reboot,
}

// ---------------------------------------------------------------------------
// sysfs link monitor
// ---------------------------------------------------------------------------

pub struct LinkMonitor {
    operstate: PathBuf,
    carrier: PathBuf,
    interface: String,
    policy: RestartPolicy,
}

impl LinkMonitor {
    pub fn new(interface: &str, policy: RestartPolicy) -> Self {
        Self::with_sysfs_root(Path::new("/sys/class/net"), interface, policy)
    }

    pub fn with_sysfs_root(root: &Path, interface: &str, policy: RestartPolicy) -> Self {
        let dir = root.join(interface);
        Self {
            operstate: dir.join("operstate"),
            carrier: dir.join("carrier"),
            interface: interface.to_string(),
            policy,
        }
    }

    /// Poll until the link is up or `timeout` elapses.  Returns whether the
    /// link came up; callers carry on either way and let the per-cycle check
    /// decide.
    pub async fn wait_for_link(&self, timeout: Duration) -> bool {
        tracing::info!(interface = %self.interface, "waiting for network link");
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected() {
                tracing::info!(interface = %self.interface, "network link up");
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    interface = %self.interface,
                    timeout_s = timeout.as_secs(),
                    "network link still down"
                );
                return false;
            }
            sleep(LINK_POLL).await;
        }
    }

    /// `None` when the driver does not expose a carrier flag.
    fn carrier(&self) -> Option<bool> {
        std::fs::read_to_string(&self.carrier)
            .ok()
            .map(|c| c.trim() == "1")
    }
}

impl Connectivity for LinkMonitor {
    fn is_connected(&self) -> bool {
        match std::fs::read_to_string(&self.operstate) {
            Ok(state) => match state.trim() {
                "up" => true,
                // Drivers without RFC 2863 state tracking stay at "unknown"
                // while passing traffic.
                "unknown" => self.carrier().unwrap_or(true),
                _ => false,
            },
            Err(e) => {
                tracing::debug!(path = %self.operstate.display(), "operstate unreadable: {e}");
                false
            }
        }
    }

    fn restart(&mut self, reason: &str) {
        tracing::error!(reason, policy = ?self.policy, "restarting");
        if self.policy == RestartPolicy::Reboot {
            match Command::new("/sbin/reboot").status() {
                Ok(status) if status.success() => {
                    // The kernel takes it from here.
                    std::thread::sleep(Duration::from_secs(30));
                }
                Ok(status) => tracing::error!(%status, "reboot command failed"),
                Err(e) => tracing::error!("could not run reboot: {e}"),
            }
        }
        std::process::exit(RESTART_EXIT_CODE);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Fake sysfs tree; removed when the returned guard drops.
    fn fake_sysfs(operstate: Option<&str>, carrier: Option<&str>) -> TempDir {
        let root = tempfile::tempdir().unwrap();
        let iface = root.path().join("wlan0");
        std::fs::create_dir_all(&iface).unwrap();
        if let Some(state) = operstate {
            std::fs::write(iface.join("operstate"), format!("{state}\n")).unwrap();
        }
        if let Some(carrier) = carrier {
            std::fs::write(iface.join("carrier"), format!("{carrier}\n")).unwrap();
        }
        root
    }

    fn monitor(root: &TempDir, interface: &str) -> LinkMonitor {
        LinkMonitor::with_sysfs_root(root.path(), interface, RestartPolicy::Exit)
    }

    #[test]
    fn up_is_connected() {
        let root = fake_sysfs(Some("up"), None);
        assert!(monitor(&root, "wlan0").is_connected());
    }

    #[test]
    fn down_is_not_connected() {
        let root = fake_sysfs(Some("down"), Some("0"));
        assert!(!monitor(&root, "wlan0").is_connected());
    }

    #[test]
    fn dormant_is_not_connected() {
        let root = fake_sysfs(Some("dormant"), Some("1"));
        assert!(!monitor(&root, "wlan0").is_connected());
    }

    #[test]
    fn unknown_with_carrier_is_connected() {
        let root = fake_sysfs(Some("unknown"), Some("1"));
        assert!(monitor(&root, "wlan0").is_connected());
    }

    #[test]
    fn unknown_without_carrier_flag_is_connected() {
        let root = fake_sysfs(Some("unknown"), None);
        assert!(monitor(&root, "wlan0").is_connected());
    }

    #[test]
    fn unknown_with_carrier_lost_is_not_connected() {
        let root = fake_sysfs(Some("unknown"), Some("0"));
        assert!(!monitor(&root, "wlan0").is_connected());
    }

    #[test]
    fn missing_interface_is_not_connected() {
        let root = fake_sysfs(None, None);
        assert!(!monitor(&root, "eth7").is_connected());
    }

    #[tokio::test]
    async fn wait_for_link_returns_immediately_when_up() {
        let root = fake_sysfs(Some("up"), None);
        assert!(monitor(&root, "wlan0").wait_for_link(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_link_gives_up_after_timeout() {
        let root = fake_sysfs(Some("down"), None);
        assert!(!monitor(&root, "wlan0").wait_for_link(Duration::from_secs(2)).await);
    }

    #[test]
    fn restart_policy_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrap {
            restart: RestartPolicy,
        }
        let w: Wrap = toml::from_str(r#"restart = "reboot""#).unwrap();
        assert_eq!(w.restart, RestartPolicy::Reboot);
    }
}
