//! Discovery Scanner
//!
//! Runs `bluetoothctl scan` and turns its console output into
//! [`DiscoveryEvent`]s for the link manager.

use crate::domain::models::{DeviceDescriptor, DiscoveryEvent};
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::service::{DiscoveryPlatform, DiscoverySink};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Classic Bluetooth discovery through BlueZ
pub struct BluetoothctlScanner {
    scan_duration_secs: u64,
    cancel: Option<oneshot::Sender<()>>,
}

impl BluetoothctlScanner {
    pub fn new(scan_duration_secs: u64) -> Self {
        Self {
            scan_duration_secs,
            cancel: None,
        }
    }
}

impl DiscoveryPlatform for BluetoothctlScanner {
    fn start_discovery(&mut self, sink: DiscoverySink) -> Result<(), LinkError> {
        self.cancel_discovery();

        info!(
            "Starting Bluetooth discovery for {} second(s)",
            self.scan_duration_secs
        );
        let timeout = self.scan_duration_secs.to_string();
        let mut child = Command::new("bluetoothctl")
            .args(["--timeout", timeout.as_str(), "scan", "on"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LinkError::Discovery(format!("bluetoothctl: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LinkError::Discovery("bluetoothctl stdout unavailable".to_string()))?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.cancel = Some(cancel_tx);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(event) = parse_bluetoothctl_line(&line) {
                                sink.emit(event);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Failed to read bluetoothctl output");
                            break;
                        }
                    },
                    _ = &mut cancel_rx => {
                        debug!("Discovery cancelled");
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "Failed to stop bluetoothctl");
                        }
                        break;
                    }
                }
            }
            let _ = child.wait().await;
            info!("Bluetooth discovery finished");
            sink.emit(DiscoveryEvent::DiscoveryFinished);
        });

        Ok(())
    }

    fn cancel_discovery(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            info!("Stopping Bluetooth discovery...");
            let _ = cancel.send(());
        }
    }
}

impl Drop for BluetoothctlScanner {
    fn drop(&mut self) {
        self.cancel_discovery();
    }
}

/// Parse one line of `bluetoothctl` output.
///
/// Recognized forms (after stripping colors and the prompt):
///
/// ```text
/// [NEW] Device 00:11:22:33:44:55 DMG Turret
/// [CHG] Device 00:11:22:33:44:55 Name: DMG Turret
/// [CHG] Device 00:11:22:33:44:55 UUIDs: 97d3edd0-5d56-11e9-b475-0800200c9a66
/// ```
pub fn parse_bluetoothctl_line(raw: &str) -> Option<DiscoveryEvent> {
    let line = strip_ansi(raw);

    if let Some((_, rest)) = line.split_once("[NEW] Device ") {
        let (address, name) = split_address(rest)?;
        // Unnamed devices are listed with their address, dashed
        let name = if name.replace('-', ":").eq_ignore_ascii_case(address) {
            ""
        } else {
            name
        };
        return Some(DiscoveryEvent::DeviceFound(DeviceDescriptor::new(
            name, address,
        )));
    }

    if let Some((_, rest)) = line.split_once("[CHG] Device ") {
        let (address, change) = split_address(rest)?;
        if let Some(name) = change.strip_prefix("Name: ") {
            return Some(DiscoveryEvent::DeviceFound(DeviceDescriptor::new(
                name.trim(),
                address,
            )));
        }
        if let Some(ids) = change.strip_prefix("UUIDs: ") {
            let ids = ids.split_whitespace().map(str::to_string).collect();
            return Some(DiscoveryEvent::ServiceIdsResolved {
                address: address.to_string(),
                ids,
            });
        }
    }

    None
}

fn split_address(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim();
    let (address, tail) = rest.split_once(' ').unwrap_or((rest, ""));
    is_mac_address(address).then(|| (address, tail.trim()))
}

fn is_mac_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Drop ANSI escape sequences and carriage returns.
fn strip_ansi(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => {
                // CSI sequences end at the first ASCII letter
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device() {
        let event = parse_bluetoothctl_line("[NEW] Device 00:1A:7D:DA:71:13 DMG Turret");
        assert_eq!(
            event,
            Some(DiscoveryEvent::DeviceFound(DeviceDescriptor::new(
                "DMG Turret",
                "00:1A:7D:DA:71:13"
            )))
        );
    }

    #[test]
    fn test_colored_output_with_prompt() {
        let raw = "\r\x1b[K[\x1b[0;92mNEW\x1b[0m] Device 00:1A:7D:DA:71:13 turret\r";
        let event = parse_bluetoothctl_line(raw);
        assert_eq!(
            event,
            Some(DiscoveryEvent::DeviceFound(DeviceDescriptor::new(
                "turret",
                "00:1A:7D:DA:71:13"
            )))
        );
    }

    #[test]
    fn test_unnamed_device() {
        let event = parse_bluetoothctl_line("[NEW] Device 4C:0F:3A:11:22:33 4C-0F-3A-11-22-33");
        assert_eq!(
            event,
            Some(DiscoveryEvent::DeviceFound(DeviceDescriptor::new(
                "",
                "4C:0F:3A:11:22:33"
            )))
        );
    }

    #[test]
    fn test_changes() {
        assert_eq!(
            parse_bluetoothctl_line("[CHG] Device 00:1A:7D:DA:71:13 Name: turret"),
            Some(DiscoveryEvent::DeviceFound(DeviceDescriptor::new(
                "turret",
                "00:1A:7D:DA:71:13"
            )))
        );
        assert_eq!(
            parse_bluetoothctl_line(
                "[CHG] Device 00:1A:7D:DA:71:13 UUIDs: 97d3edd0-5d56-11e9-b475-0800200c9a66"
            ),
            Some(DiscoveryEvent::ServiceIdsResolved {
                address: "00:1A:7D:DA:71:13".to_string(),
                ids: vec!["97d3edd0-5d56-11e9-b475-0800200c9a66".to_string()],
            })
        );
        assert_eq!(
            parse_bluetoothctl_line("[CHG] Device 00:1A:7D:DA:71:13 RSSI: -60"),
            None
        );
    }

    #[test]
    fn test_noise_is_ignored() {
        assert_eq!(parse_bluetoothctl_line("Discovery started"), None);
        assert_eq!(
            parse_bluetoothctl_line("[CHG] Controller 00:AA:BB:CC:DD:EE Discovering: yes"),
            None
        );
        assert_eq!(parse_bluetoothctl_line("[NEW] Device not-an-address x"), None);
    }
}
