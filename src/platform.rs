//! Platform detection and capability enumeration.
//!
//! Detects the OS, architecture and networking capabilities of the node so
//! the orchestrator can pick a script family once at startup.

use std::collections::HashSet;
use std::path::Path;

use crate::script::ScriptFamily;

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Kernel version (if detectable).
    pub kernel_version: Option<String>,
    /// Available capabilities.
    pub capabilities: HashSet<Capability>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

/// Capabilities that affect how units can be isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Linux network namespaces.
    NetworkNamespaces,
    /// The `ip` tool from iproute2.
    IpRoute,
    /// A DHCP client usable inside namespaces.
    DhcpClient,
}

impl Os {
    /// Parses node OS metadata as published by the node agent.
    ///
    /// Matching is case-insensitive; anything unrecognised is `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "linux" => Os::Linux,
            "darwin" | "macos" => Os::Darwin,
            "windows" => Os::Windows,
            _ => Os::Unknown,
        }
    }

    /// Script family used to launch units on this OS.
    pub fn script_family(self) -> ScriptFamily {
        match self {
            Os::Windows => ScriptFamily::PowerShell,
            _ => ScriptFamily::Posix,
        }
    }
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        let arch = Self::detect_arch();
        let kernel_version = Self::detect_kernel_version();
        let capabilities = Self::detect_capabilities(os);

        Self {
            os,
            arch,
            kernel_version,
            capabilities,
        }
    }

    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Os::Unknown;
    }

    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return Arch::Unknown;
    }

    fn detect_kernel_version() -> Option<String> {
        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("uname")
                .arg("-r")
                .output()
                .ok()
                .and_then(|o| String::from_utf8(o.stdout).ok())
                .map(|s| s.trim().to_string())
        }

        #[cfg(not(unix))]
        None
    }

    fn detect_capabilities(os: Os) -> HashSet<Capability> {
        let mut caps = HashSet::new();

        if os == Os::Linux {
            if Path::new("/proc/self/ns/net").exists() {
                caps.insert(Capability::NetworkNamespaces);
            }
            if Self::on_path("ip") {
                caps.insert(Capability::IpRoute);
            }
            if Self::on_path("dhclient") {
                caps.insert(Capability::DhcpClient);
            }
        }

        caps
    }

    /// Returns true if `binary` is found in any `PATH` entry.
    fn on_path(binary: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
            .unwrap_or(false)
    }

    /// Returns true if units can be placed in their own network namespace.
    pub fn supports_namespaces(&self) -> bool {
        self.capabilities.contains(&Capability::NetworkNamespaces)
            && self.capabilities.contains(&Capability::IpRoute)
    }

    /// Script family for the detected OS.
    pub fn script_family(&self) -> ScriptFamily {
        self.os.script_family()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}/{:?} (capabilities: {:?})",
            self.os, self.arch, self.capabilities
        )
    }
}
