//! Plugin and SDK version information.

use serde::{Deserialize, Serialize};

/// Build and version metadata reported by the Version RPC.
///
/// The SDK fills in what it knows at compile time; plugin-specific fields
/// (version, git info, build date) are merged in by the embedder, typically
/// from values injected by its build script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub plugin_version: String,
    pub sdk_version: String,
    pub build_date: String,
    pub git_commit: String,
    pub git_tag: String,
    pub language_version: String,
    pub os: String,
    pub arch: String,
}

impl VersionInfo {
    /// Version info with the SDK-known fields populated.
    pub fn collect() -> Self {
        Self {
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            ..Default::default()
        }
    }

    /// Overlay another version info onto this one. Non-empty fields from
    /// `other` win.
    pub fn merge(&mut self, other: &VersionInfo) {
        fn overlay(dst: &mut String, src: &str) {
            if !src.is_empty() {
                *dst = src.to_string();
            }
        }
        overlay(&mut self.plugin_version, &other.plugin_version);
        overlay(&mut self.sdk_version, &other.sdk_version);
        overlay(&mut self.build_date, &other.build_date);
        overlay(&mut self.git_commit, &other.git_commit);
        overlay(&mut self.git_tag, &other.git_tag);
        overlay(&mut self.language_version, &other.language_version);
        overlay(&mut self.os, &other.os);
        overlay(&mut self.arch, &other.arch);
    }
}
