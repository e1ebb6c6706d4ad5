//! The build manifest written by the compile tool and appended by the build
//! step. A simple line-oriented `key = value` format with `[section]`
//! headers; the host only consumes the keys it verifies at startup.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::context::DesignInfo;
use crate::error::{HostError, HostResult};
use crate::regmap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// `design.hash`: 64 lowercase hex characters.
    pub design_hash: Option<String>,
    /// `shell.version_hex`: the shell version the toolchain targeted.
    pub shell_version_hex: Option<u32>,
    /// `build.transformed_sha256`, appended by the build step.
    pub transformed_sha256: Option<String>,
    /// `build.timestamp`, appended by the build step.
    pub timestamp: Option<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> HostResult<Manifest> {
        let text = fs::read_to_string(path)
            .map_err(|e| HostError::InvalidArg(format!("{}: {e}", path.display())))?;
        Manifest::parse(&text)
    }

    pub fn parse(text: &str) -> HostResult<Manifest> {
        let mut manifest = Manifest::default();
        let mut section = String::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(HostError::InvalidArg(format!(
                    "manifest line {}: expected `key = value`",
                    lineno + 1
                )));
            };
            let (key, value) = (key.trim(), value.trim());
            match (section.as_str(), key) {
                ("design", "hash") => manifest.design_hash = Some(value.to_string()),
                ("shell", "version_hex") => {
                    let raw = value.trim_start_matches("0x");
                    let parsed = u32::from_str_radix(raw, 16).map_err(|_| {
                        HostError::InvalidArg(format!(
                            "manifest line {}: bad shell.version_hex",
                            lineno + 1
                        ))
                    })?;
                    manifest.shell_version_hex = Some(parsed);
                }
                ("build", "transformed_sha256") => {
                    manifest.transformed_sha256 = Some(value.to_string())
                }
                ("build", "timestamp") => manifest.timestamp = Some(value.to_string()),
                _ => {} // keys owned by other tools
            }
        }
        Ok(manifest)
    }

    /// Startup verification against the connected design. Mismatches warn
    /// loudly but never abort: an out-of-date manifest is a diagnosis aid,
    /// not a gate.
    pub fn verify(&self, info: &DesignInfo) {
        match &self.design_hash {
            Some(expected) if *expected != info.hash_hex() => {
                warn!(
                    "DESIGN HASH MISMATCH: manifest says {expected}, device reports {} -- \
                     the loaded bitstream/simulator does not match this work directory",
                    info.hash_hex()
                );
            }
            Some(_) => info!("design hash verified"),
            None => warn!("manifest carries no design hash; skipping verification"),
        }
        verify_shell_version(info.shell_version);
    }
}

/// Compares the device-reported shell version against ours.
pub fn verify_shell_version(device: u32) {
    let (host_major, host_minor) = (regmap::SHELL_VERSION >> 16, regmap::SHELL_VERSION & 0xFFFF);
    let (dev_major, dev_minor) = (device >> 16, device & 0xFFFF);
    if dev_major != host_major {
        warn!("shell version major mismatch: host {host_major}.{host_minor}, device {dev_major}.{dev_minor}");
    } else if dev_minor > host_minor {
        warn!("device shell {dev_major}.{dev_minor} is newer than host {host_major}.{host_minor}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_comments_and_keys() {
        let text = "\
# produced by the compile tool
[design]
hash = 0000000800000007000000060000000500000004000000030000000200000001

[shell]
version_hex = 0x00010000

[build]
transformed_sha256 = cafebabe
timestamp = 2024-06-01T12:00:00Z
";
        let m = Manifest::parse(text).unwrap();
        assert_eq!(m.design_hash.as_deref(), Some("0000000800000007000000060000000500000004000000030000000200000001"));
        assert_eq!(m.shell_version_hex, Some(0x0001_0000));
        assert_eq!(m.transformed_sha256.as_deref(), Some("cafebabe"));
        assert_eq!(m.timestamp.as_deref(), Some("2024-06-01T12:00:00Z"));
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let m = Manifest::parse("[future]\nkey = value\n").unwrap();
        assert_eq!(m, Manifest::default());
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(Manifest::parse("[design]\nno equals sign here\n").is_err());
        assert!(Manifest::parse("[shell]\nversion_hex = zz\n").is_err());
    }
}
