// Copyright 2020 Joyent, Inc.

//! Key-value configuration.
//!
//! The configuration file holds one `CATEGORY KEY VALUE...` entry per line;
//! `#` starts a comment. An environment variable named `CATEGORY_KEY`
//! overrides the file entry of the same name.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RfioError;

pub const CATEGORY: &str = "RFIOD";

pub const DEFAULT_NBUF: usize = 4;
pub const DEFAULT_BUFSIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_PORT_RANGE: (u16, u16) = (50000, 55000);
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 16 * 1024;
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);
pub const CKSUM_TYPE_ADLER32: &str = "ADLER32";

#[derive(Debug, Clone)]
pub struct ConfigSource {
    entries: HashMap<(String, String), String>,
    use_env: bool,
}

impl ConfigSource {
    /// An empty source that still honours environment overrides.
    pub fn new() -> ConfigSource {
        ConfigSource {
            entries: HashMap::new(),
            use_env: true,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ConfigSource, RfioError> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            RfioError::Config(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(ConfigSource::parse(&text))
    }

    pub fn parse(text: &str) -> ConfigSource {
        let mut source = ConfigSource::new();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(idx) => &line[..idx],
                None => line,
            };
            let mut fields = line.split_whitespace();
            if let (Some(category), Some(key)) = (fields.next(), fields.next())
            {
                let value = fields.collect::<Vec<_>>().join(" ");
                source.set(category, key, &value);
            }
        }
        source
    }

    /// Ignore environment overrides; used where the process environment must
    /// not leak in.
    pub fn without_env(mut self) -> ConfigSource {
        self.use_env = false;
        self
    }

    pub fn set(&mut self, category: &str, key: &str, value: &str) {
        self.entries.insert(
            (category.to_uppercase(), key.to_uppercase()),
            value.to_string(),
        );
    }

    pub fn get(&self, category: &str, key: &str) -> Option<String> {
        let category = category.to_uppercase();
        let key = key.to_uppercase();
        if self.use_env {
            if let Ok(value) = std::env::var(format!("{}_{}", category, key)) {
                return Some(value);
            }
        }
        self.entries.get(&(category, key)).cloned()
    }

    fn get_parsed<T: FromStr>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, RfioError> {
        match self.get(CATEGORY, key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                RfioError::Config(format!("invalid value {:?} for {}", raw, key))
            }),
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, RfioError> {
        match self.get(CATEGORY, key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_uppercase().as_str() {
                "YES" | "Y" | "TRUE" | "1" | "ON" => Ok(true),
                "NO" | "N" | "FALSE" | "0" | "OFF" => Ok(false),
                _ => Err(RfioError::Config(format!(
                    "invalid boolean {:?} for {}",
                    raw, key
                ))),
            },
        }
    }

    fn get_list(&self, key: &str) -> Vec<String> {
        self.get(CATEGORY, key)
            .map(|raw| {
                raw.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Buffering settings of one transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub use_threads: bool,
    pub nbuf: usize,
    pub buffer_size: usize,
}

impl Default for StreamSettings {
    fn default() -> StreamSettings {
        StreamSettings {
            use_threads: true,
            nbuf: DEFAULT_NBUF,
            buffer_size: DEFAULT_BUFSIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RfioConfig {
    pub read: StreamSettings,
    pub write: StreamSettings,
    pub direct_io: bool,
    pub preallocation_size: u64,
    /// Inclusive port range for data sockets; `(0, 0)` lets the OS choose.
    pub port_range: (u16, u16),
    pub checksum: bool,
    pub checksum_type: String,
    pub allow_nonlocal_direct: bool,
    pub max_request_size: usize,
    pub accept_timeout: Duration,
    /// Hosts granted each capability, keyed by capability name.
    pub trust: HashMap<String, Vec<String>>,
}

impl Default for RfioConfig {
    fn default() -> RfioConfig {
        RfioConfig {
            read: StreamSettings::default(),
            write: StreamSettings::default(),
            direct_io: false,
            preallocation_size: 0,
            port_range: DEFAULT_PORT_RANGE,
            checksum: true,
            checksum_type: CKSUM_TYPE_ADLER32.to_string(),
            allow_nonlocal_direct: false,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            trust: HashMap::new(),
        }
    }
}

const TRUST_KEYS: &[(&str, &str)] = &[
    ("OPEN_TRUST", "open-trust"),
    ("READ_TRUST", "read-trust"),
    ("WRITE_TRUST", "write-trust"),
    ("STAT_TRUST", "stat-trust"),
];

fn stream_settings(
    source: &ConfigSource,
    prefix: &str,
) -> Result<StreamSettings, RfioError> {
    let defaults = StreamSettings::default();
    let settings = StreamSettings {
        use_threads: source
            .get_bool(&format!("{}_USE_THREADS", prefix), defaults.use_threads)?,
        nbuf: source.get_parsed(&format!("{}_NBUF", prefix), defaults.nbuf)?,
        buffer_size: source
            .get_parsed(&format!("{}_BUFSIZE", prefix), defaults.buffer_size)?,
    };
    if settings.nbuf == 0 || settings.buffer_size == 0 {
        return Err(RfioError::Config(format!(
            "{} buffer count and size must be positive",
            prefix
        )));
    }
    Ok(settings)
}

fn parse_port_range(raw: &str) -> Result<(u16, u16), RfioError> {
    let invalid = || RfioError::Config(format!("invalid PORT_RANGE {:?}", raw));
    let mut parts = raw.split(',').map(str::trim);
    let low: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    let high: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    if low > high || parts.next().is_some() {
        return Err(invalid());
    }
    Ok((low, high))
}

impl RfioConfig {
    pub fn from_source(source: &ConfigSource) -> Result<RfioConfig, RfioError> {
        let defaults = RfioConfig::default();
        let port_range = match source.get(CATEGORY, "PORT_RANGE") {
            Some(raw) => parse_port_range(&raw)?,
            None => defaults.port_range,
        };
        let mut trust = HashMap::new();
        for (key, capability) in TRUST_KEYS {
            let hosts = source.get_list(key);
            if !hosts.is_empty() {
                trust.insert(capability.to_string(), hosts);
            }
        }

        let checksum_type = source
            .get(CATEGORY, "CKSUM_TYPE")
            .map(|s| s.trim().to_uppercase())
            .unwrap_or(defaults.checksum_type);
        if checksum_type != CKSUM_TYPE_ADLER32 {
            return Err(RfioError::Config(format!(
                "unsupported CKSUM_TYPE {:?}, only {} is available",
                checksum_type, CKSUM_TYPE_ADLER32
            )));
        }

        Ok(RfioConfig {
            read: stream_settings(source, "READ")?,
            write: stream_settings(source, "WRITE")?,
            direct_io: source.get_bool("DIRECTIO", defaults.direct_io)?,
            preallocation_size: source
                .get_parsed("PREALLOCATION_SIZE", defaults.preallocation_size)?,
            port_range,
            checksum: source.get_bool("USE_CKSUM", defaults.checksum)?,
            checksum_type,
            allow_nonlocal_direct: source
                .get_bool("ALLOW_NONLOCAL_DIRECT", defaults.allow_nonlocal_direct)?,
            max_request_size: source
                .get_parsed("MAX_REQUEST_SIZE", defaults.max_request_size)?,
            accept_timeout: Duration::from_secs(source.get_parsed(
                "ACCEPT_TIMEOUT",
                defaults.accept_timeout.as_secs(),
            )?),
            trust,
        })
    }

    /// Whether checksums are both enabled and of the one supported type.
    pub fn checksum_enabled(&self) -> bool {
        self.checksum && self.checksum_type == CKSUM_TYPE_ADLER32
    }
}
