//! Kernel IP forwarding toggle

use crate::core::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the parameter gating IPv4 forwarding.
pub const IPV4_FORWARD: &str = "net.ipv4.ip_forward";

/// Sets a kernel parameter for the session and puts it back afterwards.
///
/// Both calls are idempotent. `unset` never overwrites a value `set` did not
/// change.
pub trait SysctlSetter: Send {
    fn set(&mut self) -> Result<()>;
    fn unset(&mut self) -> Result<()>;
}

impl<T: SysctlSetter + ?Sized> SysctlSetter for Box<T> {
    fn set(&mut self) -> Result<()> {
        (**self).set()
    }

    fn unset(&mut self) -> Result<()> {
        (**self).unset()
    }
}

/// Leaves the kernel alone, for hosts where forwarding is managed elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmanagedSysctl;

impl SysctlSetter for UnmanagedSysctl {
    fn set(&mut self) -> Result<()> {
        Ok(())
    }

    fn unset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A `/proc/sys` parameter forced to a desired value.
#[derive(Debug, Clone)]
pub struct KernelParam {
    name: String,
    desired: String,
    proc_root: PathBuf,
    /// Value found before `set` changed it
    original: Option<String>,
}

impl KernelParam {
    pub fn new(name: impl Into<String>, desired: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desired: desired.into(),
            proc_root: PathBuf::from("/proc/sys"),
            original: None,
        }
    }

    /// `net.ipv4.ip_forward = 1`
    pub fn ipv4_forwarding() -> Self {
        Self::new(IPV4_FORWARD, "1")
    }

    /// Reads and writes under `root` instead of `/proc/sys`.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn path(&self) -> PathBuf {
        self.name
            .split('.')
            .fold(self.proc_root.clone(), |path, part| path.join(part))
    }

    fn sysctl_error(&self, source: std::io::Error) -> Error {
        Error::Sysctl {
            param: self.name.clone(),
            source,
        }
    }

    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path)
            .map(|value| value.trim().to_string())
            .map_err(|e| self.sysctl_error(e))
    }

    fn write(&self, path: &Path, value: &str) -> Result<()> {
        fs::write(path, format!("{value}\n")).map_err(|e| self.sysctl_error(e))
    }
}

impl SysctlSetter for KernelParam {
    fn set(&mut self) -> Result<()> {
        let path = self.path();
        let current = self.read(&path)?;
        if current == self.desired {
            debug!("{} already {}", self.name, self.desired);
            return Ok(());
        }

        self.write(&path, &self.desired)?;
        info!("{} set to {} (was {current})", self.name, self.desired);
        if self.original.is_none() {
            self.original = Some(current);
        }
        Ok(())
    }

    fn unset(&mut self) -> Result<()> {
        let Some(original) = self.original.clone() else {
            debug!("{} was not changed, leaving it alone", self.name);
            return Ok(());
        };

        self.write(&self.path(), &original)?;
        self.original = None;
        info!("{} restored to {original}", self.name);
        Ok(())
    }
}
