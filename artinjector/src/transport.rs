// Device transport
//
// The injector talks to devices through this trait so the orchestrator can
// be driven by a scripted transport in tests. The real implementation shells
// out to adb.

use crate::apk::abi_tag_for_device_abi;
use crate::error::InjectError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Device {
    pub serial: String,
}

/// A running debuggable process on a device.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Local TCP port forwarded to the process's JDWP endpoint.
    pub debug_port: u16,
    /// Abi tag, e.g. "64-bit (arm64)".
    pub abi: String,
}

pub trait Transport {
    fn list_devices(&self) -> Result<Vec<Device>, InjectError>;

    /// Look the package up among the device's debuggable processes. `None`
    /// when it is not running (yet); callers poll.
    fn find_debuggable_process(
        &self,
        device: &Device,
        package: &str,
    ) -> Result<Option<ProcessInfo>, InjectError>;

    fn push(&self, device: &Device, local: &Path, remote: &str) -> Result<(), InjectError>;

    /// Run a shell command on the device and return its trimmed output.
    fn shell(&self, device: &Device, args: &[&str]) -> Result<String, InjectError>;

    fn is_rooted(&self, device: &Device) -> bool;

    /// Try to restart adbd as root. Returns whether the device is rooted
    /// afterwards.
    fn elevate_to_root(&self, device: &Device) -> bool;
}

/// Transport backed by the adb binary.
pub struct AdbTransport {
    adb_path: PathBuf,
}

impl AdbTransport {
    pub fn new(adb_path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, InjectError> {
        debug!("adb {}", args.join(" "));
        let output = Command::new(&self.adb_path)
            .args(args)
            .output()
            .map_err(|e| InjectError::AdbUnavailable(format!("{}: {}", self.adb_path.display(), e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InjectError::AdbUnavailable(format!(
                "adb {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_on(&self, device: &Device, args: &[&str]) -> Result<String, InjectError> {
        let mut full = vec!["-s", device.serial.as_str()];
        full.extend_from_slice(args);
        self.run(&full)
    }
}

impl Transport for AdbTransport {
    fn list_devices(&self) -> Result<Vec<Device>, InjectError> {
        let output = self.run(&["devices"])?;
        let devices = output
            .lines()
            .skip(1) // "List of devices attached" banner
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let serial = parts.next()?;
                let state = parts.next()?;
                (state == "device").then(|| Device {
                    serial: serial.to_string(),
                })
            })
            .collect();
        Ok(devices)
    }

    fn find_debuggable_process(
        &self,
        device: &Device,
        package: &str,
    ) -> Result<Option<ProcessInfo>, InjectError> {
        let pid_output = self.shell(device, &["pidof", "-s", package])?;
        let Ok(pid) = pid_output.trim().parse::<u32>() else {
            return Ok(None);
        };

        let abi_prop = self.shell(device, &["getprop", "ro.product.cpu.abi"])?;
        let Some(abi) = abi_tag_for_device_abi(&abi_prop) else {
            return Err(InjectError::UnsupportedAbi(abi_prop));
        };

        // forward a fresh local port to the process's JDWP endpoint
        let port_output = self.run_on(device, &["forward", "tcp:0", &format!("jdwp:{}", pid)])?;
        let debug_port = port_output.trim().parse::<u16>().map_err(|_| {
            InjectError::AdbUnavailable(format!("unexpected forward output: {}", port_output))
        })?;

        info!(
            "found app, package={}, pid={}, abi={}, debug port={}",
            package, pid, abi, debug_port
        );
        Ok(Some(ProcessInfo {
            pid,
            debug_port,
            abi: abi.to_string(),
        }))
    }

    fn push(&self, device: &Device, local: &Path, remote: &str) -> Result<(), InjectError> {
        let local = local.to_string_lossy();
        self.run_on(device, &["push", &local, remote])?;
        Ok(())
    }

    fn shell(&self, device: &Device, args: &[&str]) -> Result<String, InjectError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.run_on(device, &full)
    }

    fn is_rooted(&self, device: &Device) -> bool {
        matches!(self.shell(device, &["id"]), Ok(out) if out.contains("uid=0"))
    }

    fn elevate_to_root(&self, device: &Device) -> bool {
        if self.run_on(device, &["root"]).is_err() {
            return false;
        }
        self.is_rooted(device)
    }
}
