//! INI configuration loading.
//!
//! The configuration dialect is line-based `[section]` / `key = value` with
//! `#` and `;` comments. Unknown keys are ignored with a warning so config
//! files can carry forward keys for newer builds. The parser is an isolated
//! helper with no engine coupling.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use crate::error::{Error, Result};
use crate::types::LinkType;

/// A parsed INI document: section → key → value, order-insensitive.
#[derive(Debug, Clone, Default)]
pub struct Ini {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Ini {
    pub fn parse(input: &str) -> Ini {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = String::new();

        for raw in input.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                if let Some(name) = rest.strip_suffix(']') {
                    current = name.trim().to_string();
                    sections.entry(current.clone()).or_default();
                } else {
                    warn!(line = raw, "ignoring malformed section header");
                }
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    sections
                        .entry(current.clone())
                        .or_default()
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
                None => warn!(line = raw, "ignoring malformed configuration line"),
            }
        }

        Ini { sections }
    }

    pub fn load(path: &Path) -> Result<Ini> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(Ini::parse(&text))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    fn get_parsed<T: FromStr>(&self, section: &str, key: &str) -> Option<T> {
        let raw = self.get(section, key)?;
        match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(section, key, value = raw, "unparseable value, using default");
                None
            }
        }
    }

    fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        let raw = self.get(section, key)?;
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => {
                warn!(section, key, value = raw, "unparseable boolean, using default");
                None
            }
        }
    }

    /// Warn about keys nobody recognized. `known` maps section → key list.
    fn warn_unknown(&self, known: &[(&str, &[&str])]) {
        for (section, keys) in &self.sections {
            let recognized = known.iter().find(|(s, _)| s == section);
            match recognized {
                None => warn!(section, "ignoring unknown configuration section"),
                Some((_, names)) => {
                    for key in keys.keys() {
                        if !names.contains(&key.as_str()) {
                            warn!(section, key, "ignoring unknown configuration key");
                        }
                    }
                }
            }
        }
    }
}

// ── Daemon configuration ────────────────────────────────────────────

const DAEMON_KEYS: &[(&str, &[&str])] = &[
    ("general", &["name"]),
    ("socket", &["listen_addr", "worker_threads"]),
    ("interface", &["name", "ip_address"]),
    ("timing", &["stats_cache_ttl_sec", "watchdog_interval_sec"]),
];

/// Top-level `magicd` configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub name: String,
    pub listen_addr: String,
    pub worker_threads: usize,
    /// Southbound interface client traffic enters on.
    pub ingress_interface: String,
    pub ingress_ip: Option<IpAddr>,
    pub stats_cache_ttl_sec: u64,
    pub watchdog_interval_sec: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            name: "magicd".to_string(),
            listen_addr: "0.0.0.0:3868".to_string(),
            worker_threads: 4,
            ingress_interface: "eth0".to_string(),
            ingress_ip: None,
            stats_cache_ttl_sec: 2,
            watchdog_interval_sec: 30,
        }
    }
}

impl DaemonConfig {
    pub fn from_ini(ini: &Ini) -> DaemonConfig {
        ini.warn_unknown(DAEMON_KEYS);
        let defaults = DaemonConfig::default();
        DaemonConfig {
            name: ini
                .get("general", "name")
                .map(str::to_string)
                .unwrap_or(defaults.name),
            listen_addr: ini
                .get("socket", "listen_addr")
                .map(str::to_string)
                .unwrap_or(defaults.listen_addr),
            worker_threads: ini
                .get_parsed("socket", "worker_threads")
                .unwrap_or(defaults.worker_threads),
            ingress_interface: ini
                .get("interface", "name")
                .map(str::to_string)
                .unwrap_or(defaults.ingress_interface),
            ingress_ip: ini.get_parsed("interface", "ip_address"),
            stats_cache_ttl_sec: ini
                .get_parsed("timing", "stats_cache_ttl_sec")
                .unwrap_or(defaults.stats_cache_ttl_sec),
            watchdog_interval_sec: ini
                .get_parsed("timing", "watchdog_interval_sec")
                .unwrap_or(defaults.watchdog_interval_sec),
        }
    }
}

// ── Per-link profiles ───────────────────────────────────────────────

const LINK_KEYS: &[(&str, &[&str])] = &[
    ("general", &["link_name", "link_type", "priority"]),
    ("interface", &["name", "ip_address", "gateway", "netmask"]),
    ("bandwidth", &["max_forward_link_kbps", "max_return_link_kbps"]),
    ("latency", &["delay_ms", "jitter_ms"]),
    (
        "signal",
        &[
            "rssi_threshold_dbm",
            "rssi_min_dbm",
            "rssi_max_dbm",
            "initial_rssi_dbm",
        ],
    ),
    ("cost", &["per_mb_cents", "factor"]),
    (
        "network",
        &[
            "security_level",
            "mtu",
            "ground_only",
            "dns_primary",
            "dns_secondary",
        ],
    ),
    (
        "timing",
        &[
            "reporting_interval_sec",
            "going_down_lead_time_ms",
        ],
    ),
];

/// A per-link driver profile, one INI file per link.
#[derive(Debug, Clone)]
pub struct LinkProfile {
    pub link_name: String,
    pub link_type: LinkType,
    pub priority: u8,
    pub interface_name: String,
    pub ip_address: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub max_fwd_kbps: u32,
    pub max_rev_kbps: u32,
    pub delay_ms: u32,
    pub jitter_ms: u32,
    pub rssi_threshold_dbm: i32,
    pub rssi_min_dbm: i32,
    pub rssi_max_dbm: i32,
    pub initial_rssi_dbm: i32,
    pub cost_per_mb_cents: u32,
    pub security_level: u8,
    pub mtu: u16,
    pub ground_only: bool,
    pub dns_primary: Option<IpAddr>,
    pub dns_secondary: Option<IpAddr>,
    pub reporting_interval_sec: u64,
    pub going_down_lead_time_ms: u64,
}

impl LinkProfile {
    pub fn from_ini(ini: &Ini) -> Result<LinkProfile> {
        ini.warn_unknown(LINK_KEYS);

        let interface_name = ini
            .get("interface", "name")
            .ok_or_else(|| Error::InvalidArgument("link profile missing [interface] name".into()))?
            .to_string();
        let link_name = ini
            .get("general", "link_name")
            .unwrap_or(&interface_name)
            .to_string();
        let link_type = ini
            .get("general", "link_type")
            .and_then(|v| v.parse().ok())
            .unwrap_or(LinkType::Other);

        Ok(LinkProfile {
            link_name,
            link_type,
            priority: ini.get_parsed("general", "priority").unwrap_or(0),
            interface_name,
            ip_address: ini.get_parsed("interface", "ip_address"),
            gateway: ini.get_parsed("interface", "gateway"),
            max_fwd_kbps: ini
                .get_parsed("bandwidth", "max_forward_link_kbps")
                .unwrap_or(0),
            max_rev_kbps: ini
                .get_parsed("bandwidth", "max_return_link_kbps")
                .unwrap_or(0),
            delay_ms: ini.get_parsed("latency", "delay_ms").unwrap_or(0),
            jitter_ms: ini.get_parsed("latency", "jitter_ms").unwrap_or(0),
            rssi_threshold_dbm: ini
                .get_parsed("signal", "rssi_threshold_dbm")
                .unwrap_or(-90),
            rssi_min_dbm: ini.get_parsed("signal", "rssi_min_dbm").unwrap_or(-100),
            rssi_max_dbm: ini.get_parsed("signal", "rssi_max_dbm").unwrap_or(-40),
            initial_rssi_dbm: ini
                .get_parsed("signal", "initial_rssi_dbm")
                .unwrap_or(-60),
            cost_per_mb_cents: ini.get_parsed("cost", "per_mb_cents").unwrap_or(0),
            security_level: ini.get_parsed("network", "security_level").unwrap_or(0),
            mtu: ini.get_parsed("network", "mtu").unwrap_or(1500),
            ground_only: ini.get_bool("network", "ground_only").unwrap_or(false),
            dns_primary: ini.get_parsed("network", "dns_primary"),
            dns_secondary: ini.get_parsed("network", "dns_secondary"),
            reporting_interval_sec: ini
                .get_parsed("timing", "reporting_interval_sec")
                .unwrap_or(5),
            going_down_lead_time_ms: ini
                .get_parsed("timing", "going_down_lead_time_ms")
                .unwrap_or(3000),
        })
    }
}
