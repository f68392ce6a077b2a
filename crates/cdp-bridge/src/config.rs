use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use which::which;

/// Tuning for the persistent browser connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    pub executable: Option<PathBuf>,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    /// Connect to an existing DevTools endpoint instead of launching.
    pub websocket_url: Option<String>,
    pub default_deadline_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_cap_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            executable: detect_chrome_executable(),
            user_data_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            websocket_url: None,
            default_deadline_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            backoff_base_ms: 250,
            backoff_factor: 2.0,
            backoff_cap_ms: 30_000,
        }
    }
}

impl TransportConfig {
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        self.executable
            .clone()
            .filter(|path| path.exists())
            .or_else(detect_chrome_executable)
    }
}

/// Tuning for per-tab debugging sessions and capture.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub transport: TransportConfig,
    /// How long an attached tab session may sit unused before auto-release.
    pub attach_idle_ms: u64,
    /// Settle delay after a forced detach/reattach cycle.
    pub reattach_settle_ms: u64,
    /// Largest rendered edge, in device pixels, for any capture.
    pub capture_max_dimension: u32,
    /// Full-page captures taller than this many viewports fall back to
    /// a viewport capture.
    pub capture_fullpage_viewport_cap: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            attach_idle_ms: 5_000,
            reattach_settle_ms: 75,
            capture_max_dimension: 7_800,
            capture_fullpage_viewport_cap: 30,
        }
    }
}

fn resolve_headless_default() -> bool {
    match env::var("TABRELAY_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            !matches!(lower.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn default_profile_dir() -> PathBuf {
    if let Ok(path) = env::var("TABRELAY_CHROME_PROFILE") {
        return PathBuf::from(path);
    }
    Path::new("./.tabrelay-profile").into()
}

fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("TABRELAY_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    for candidate in os_specific_chrome_paths() {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }
    #[cfg(target_os = "macos")]
    {
        &["Google Chrome", "Chromium"]
    }
    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }
    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ]
    }
    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/snap/bin/chromium"),
        ]
    }
}
