//! Compiler environment overlay for wheel builds.

use std::collections::BTreeMap;

use crate::config::ToolchainConfig;

const ZIG_CC: &str = "zig cc";
const ZIG_CXX: &str = "zig c++";
const ZIG_CFLAGS: &str = "-mtune=x86_64 -lc++ -Os -g0 -ftls-model=global-dynamic -Wl,--strip-all";

/// Environment variables layered over the ambient process environment of
/// the build tool. An empty overlay leaves the environment untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolchainOverlay {
    vars: BTreeMap<String, String>,
}

impl ToolchainOverlay {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }
}

/// Computes the overlay for the configured toolchain.
///
/// The overlay only carries compiler selection. The executor's own pip
/// defaults (`PIP_NO_INPUT` and friends) are applied regardless and are not
/// part of it, so an empty overlay leaves every compiler variable inherited.
#[must_use]
pub fn resolve(config: &ToolchainConfig) -> ToolchainOverlay {
    let mut overlay = ToolchainOverlay::default();
    let configured = config
        .alternate
        .as_deref()
        .is_some_and(|value| !value.trim().is_empty());
    if configured {
        overlay.set("CC", ZIG_CC);
        overlay.set("CXX", ZIG_CXX);
        overlay.set("CFLAGS", ZIG_CFLAGS);
    }
    overlay
}
