//! Launching-browser attribution
//!
//! Walks the host's process ancestry at startup, bounded to
//! [`MAX_DEPTH`] levels, and names the first ancestor that is a known
//! browser. When none is found the direct parent is reported instead.

use std::path::PathBuf;

use sysinfo::{Pid, System};
use tracing::debug;

use crate::types::BrowserInfo;

/// Ancestors inspected above the host process
pub const MAX_DEPTH: usize = 8;

/// Executable stems and the browser each one belongs to.
const KNOWN_BROWSERS: &[(&str, &str)] = &[
    ("chrome", "Chrome"),
    ("google-chrome", "Chrome"),
    ("google-chrome-stable", "Chrome"),
    ("chromium", "Chromium"),
    ("chromium-browser", "Chromium"),
    ("msedge", "Edge"),
    ("microsoft-edge", "Edge"),
    ("brave", "Brave"),
    ("brave-browser", "Brave"),
    ("vivaldi", "Vivaldi"),
    ("opera", "Opera"),
    ("firefox", "Firefox"),
    ("firefox-bin", "Firefox"),
];

/// One process in the ancestry chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    KnownBrowser(BrowserInfo),
    /// No browser among the ancestors; describes the direct parent
    UnknownFallback(BrowserInfo),
}

impl Attribution {
    pub fn browser(&self) -> &BrowserInfo {
        match self {
            Attribution::KnownBrowser(info) | Attribution::UnknownFallback(info) => info,
        }
    }

    pub fn into_browser(self) -> BrowserInfo {
        match self {
            Attribution::KnownBrowser(info) | Attribution::UnknownFallback(info) => info,
        }
    }
}

fn known_browser(process: &ProcessInfo) -> Option<&'static str> {
    let lower = process.name.to_ascii_lowercase();
    let stem = lower.strip_suffix(".exe").unwrap_or(&lower);
    KNOWN_BROWSERS
        .iter()
        .find(|(exe, _)| *exe == stem)
        .map(|(_, name)| *name)
}

fn binary_of(process: &ProcessInfo) -> String {
    process
        .exe
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| process.name.clone())
}

/// Attribute a launch from an ancestry chain. `chain[0]` is the host
/// itself, `chain[1]` its parent, and so on.
pub fn attribute(chain: &[ProcessInfo], extension_id: Option<&str>) -> Attribution {
    let extension_id = extension_id.map(str::to_string);

    for process in chain.iter().skip(1).take(MAX_DEPTH) {
        if let Some(name) = known_browser(process) {
            return Attribution::KnownBrowser(BrowserInfo {
                name: name.to_string(),
                binary: binary_of(process),
                extension_id,
            });
        }
    }

    let parent = chain.get(1);
    Attribution::UnknownFallback(BrowserInfo {
        name: parent.map(|p| p.name.clone()).unwrap_or_else(|| "unknown".into()),
        binary: parent.map(binary_of).unwrap_or_default(),
        extension_id,
    })
}

/// The current process followed by up to [`MAX_DEPTH`] ancestors.
pub fn process_chain() -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_processes();

    let mut chain = Vec::new();
    let mut next = Some(Pid::from_u32(std::process::id()));
    while let Some(pid) = next {
        if chain.len() > MAX_DEPTH {
            break;
        }
        let Some(process) = system.process(pid) else {
            break;
        };
        chain.push(ProcessInfo {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            exe: process.exe().map(|p| p.to_path_buf()),
        });
        next = process.parent().filter(|parent| *parent != pid);
    }
    chain
}

/// Attribute the browser that launched this process.
pub fn attribute_current_process(extension_id: Option<&str>) -> Attribution {
    let chain = process_chain();
    let attribution = attribute(&chain, extension_id);
    debug!(depth = chain.len(), ?attribution, "Attributed launching process");
    attribution
}
