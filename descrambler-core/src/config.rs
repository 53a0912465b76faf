use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cipher::CipherType;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub descrambler: DescramblerConfig,
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// What happens to scrambled packets once no backend can provide a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    #[default]
    PassThrough,
    Drop,
}

/// Mapping of ECM table ids 0x80/0x81 to key parity. Some card servers
/// answer with the halves swapped; `Inverted` compensates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcmParity {
    #[default]
    Standard,
    Inverted,
}

/// Per-service descrambler runtime tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DescramblerConfig {
    pub queue_max_bytes: usize,
    pub parity_check_bytes: usize,
    pub key_margin_ms: u64,
    pub default_key_interval_ms: u64,
    pub no_key_timeout_ms: u64,
    pub skip_policy: SkipPolicy,
    pub ecm_parity: EcmParity,
}

impl Default for DescramblerConfig {
    fn default() -> Self {
        Self {
            queue_max_bytes: 376_000,
            parity_check_bytes: 3_760,
            key_margin_ms: 1_000,
            default_key_interval_ms: 10_000,
            no_key_timeout_ms: 10_000,
            skip_policy: SkipPolicy::PassThrough,
            ecm_parity: EcmParity::Standard,
        }
    }
}

impl DescramblerConfig {
    #[must_use]
    pub fn key_margin(&self) -> Duration {
        Duration::from_millis(self.key_margin_ms)
    }

    #[must_use]
    pub fn default_key_interval(&self) -> Duration {
        Duration::from_millis(self.default_key_interval_ms)
    }

    #[must_use]
    pub fn no_key_timeout(&self) -> Duration {
        Duration::from_millis(self.no_key_timeout_ms)
    }
}

/// One configured descrambling backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientConfig {
    Newcamd(NewcamdConfig),
    Cccam(CccamConfig),
    Constcw(ConstcwConfig),
    Dvbcam(DvbcamConfig),
}

impl ClientConfig {
    #[must_use]
    pub fn common(&self) -> &ClientCommon {
        match self {
            Self::Newcamd(c) => &c.common,
            Self::Cccam(c) => &c.common,
            Self::Constcw(c) => &c.common,
            Self::Dvbcam(c) => &c.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut ClientCommon {
        match self {
            Self::Newcamd(c) => &mut c.common,
            Self::Cccam(c) => &mut c.common,
            Self::Constcw(c) => &mut c.common,
            Self::Dvbcam(c) => &mut c.common,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.common().name
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.common().enabled
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Newcamd(_) => "newcamd",
            Self::Cccam(_) => "cccam",
            Self::Constcw(_) => "constcw",
            Self::Dvbcam(_) => "dvbcam",
        }
    }

    /// Checks one entry on its own.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.validate_into(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Checks one entry, prefixing every problem with the client name.
    fn validate_into(&self, errors: &mut Vec<String>) {
        let name = self.name();
        if name.is_empty() {
            errors.push(format!("{} client without a name", self.kind()));
        }
        match self {
            Self::Newcamd(c) => {
                if c.port == 0 {
                    errors.push(format!("{name}: port must be non-zero"));
                }
                if let Err(e) = parse_des_key(&c.deskey) {
                    errors.push(format!("{name}: {e}"));
                }
                // user + md5crypt hash must fit the one-byte login length
                if c.username.len() + 35 > 255 {
                    errors.push(format!("{name}: username too long"));
                }
            }
            Self::Cccam(c) => {
                if c.port == 0 {
                    errors.push(format!("{name}: port must be non-zero"));
                }
                if c.username.len() > 127 {
                    errors.push(format!("{name}: username longer than 127 bytes"));
                }
                if let Err(e) = c.node_id() {
                    errors.push(format!("{name}: {e}"));
                }
                if !CCCAM_VERSIONS.contains(&c.version.as_str()) {
                    errors.push(format!("{name}: unsupported version {}", c.version));
                }
            }
            Self::Constcw(c) => {
                if let Err(e) = c.keys() {
                    errors.push(format!("{name}: {e}"));
                }
            }
            Self::Dvbcam(c) => {
                if c.caids.is_empty() {
                    errors.push(format!("{name}: no CAIDs configured"));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientCommon {
    pub name: String,
    pub enabled: bool,
    pub comment: String,
}

impl Default for ClientCommon {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            comment: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewcamdConfig {
    #[serde(flatten)]
    pub common: ClientCommon,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub deskey: String,
    pub emm: bool,
    pub emmex: bool,
    pub keepalive_interval_secs: u64,
    pub ecm_timeout_secs: u64,
}

impl Default for NewcamdConfig {
    fn default() -> Self {
        Self {
            common: ClientCommon::default(),
            hostname: "localhost".to_string(),
            port: 0,
            username: String::new(),
            password: String::new(),
            deskey: "00:01:02:03:04:05:06:07:08:09:0a:0b:0c:0d".to_string(),
            emm: true,
            emmex: true,
            keepalive_interval_secs: 30,
            ecm_timeout_secs: 5,
        }
    }
}

pub const CCCAM_VERSIONS: &[&str] = &[
    "2.0.11", "2.1.1", "2.1.2", "2.1.3", "2.1.4", "2.2.0", "2.2.1", "2.3.0",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CccamConfig {
    #[serde(flatten)]
    pub common: ClientCommon,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 8 bytes hex; a random id is used when empty
    pub nodeid: String,
    pub version: String,
    pub emm: bool,
    pub emmex: bool,
    pub keepalive_interval_secs: u64,
    pub extended: bool,
    pub ecm_timeout_secs: u64,
}

impl Default for CccamConfig {
    fn default() -> Self {
        Self {
            common: ClientCommon::default(),
            hostname: "localhost".to_string(),
            port: 0,
            username: String::new(),
            password: String::new(),
            nodeid: String::new(),
            version: "2.3.0".to_string(),
            emm: false,
            emmex: true,
            keepalive_interval_secs: 0,
            extended: true,
            ecm_timeout_secs: 5,
        }
    }
}

impl CccamConfig {
    /// Configured node id, or `None` when one should be generated.
    pub fn node_id(&self) -> Result<Option<[u8; 8]>, String> {
        let digits: String = self.nodeid.chars().filter(char::is_ascii_hexdigit).collect();
        if digits.is_empty() {
            return Ok(None);
        }
        let bytes = hex::decode(&digits).map_err(|e| format!("invalid node id: {e}"))?;
        <[u8; 8]>::try_from(bytes.as_slice())
            .map(Some)
            .map_err(|_| format!("node id must be 8 bytes, got {}", bytes.len()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConstcwConfig {
    #[serde(flatten)]
    pub common: ClientCommon,
    pub algorithm: CipherType,
    pub caid: u16,
    pub provider_id: u32,
    pub tsid: u16,
    pub sid: u16,
    pub key_even: String,
    pub key_odd: String,
}

impl Default for ConstcwConfig {
    fn default() -> Self {
        Self {
            common: ClientCommon::default(),
            algorithm: CipherType::Csa,
            caid: 0,
            provider_id: 0,
            tsid: 0,
            sid: 0,
            key_even: String::new(),
            key_odd: String::new(),
        }
    }
}

impl ConstcwConfig {
    /// Decoded even and odd keys, checked against the algorithm's key size.
    pub fn keys(&self) -> Result<(Vec<u8>, Vec<u8>), String> {
        let size = self.algorithm.key_size();
        let decode = |label: &str, text: &str| -> Result<Vec<u8>, String> {
            let digits: String = text.chars().filter(char::is_ascii_hexdigit).collect();
            let key = hex::decode(&digits).map_err(|e| format!("invalid {label} key: {e}"))?;
            if key.len() != size {
                return Err(format!(
                    "{label} key must be {size} bytes for {}, got {}",
                    self.algorithm,
                    key.len()
                ));
            }
            Ok(key)
        };
        Ok((decode("even", &self.key_even)?, decode("odd", &self.key_odd)?))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DvbcamConfig {
    #[serde(flatten)]
    pub common: ClientCommon,
    pub slot: u8,
    pub caids: Vec<u16>,
}

/// Parses the 14-byte newcamd DES key. Any non-hex character separates
/// digits; a missing trailing nibble counts as zero.
pub fn parse_des_key(text: &str) -> Result<[u8; 14], String> {
    let nibbles: Vec<u8> = text
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(|d| d as u8)
        .collect();
    if nibbles.len() > 28 {
        return Err(format!("DES key has {} hex digits, expected at most 28", nibbles.len()));
    }
    if nibbles.is_empty() {
        return Err("DES key is empty".to_string());
    }
    let mut key = [0u8; 14];
    for (i, nibble) in nibbles.iter().enumerate() {
        key[i / 2] |= if i % 2 == 0 { nibble << 4 } else { *nibble };
    }
    Ok(key)
}

impl Config {
    /// Load configuration from multiple sources
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file (if provided)
    /// 3. Default values
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // DESCRAMBLER_LOGGING_LEVEL, etc.
        builder = builder.add_source(
            Environment::with_prefix("DESCRAMBLER")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.descrambler.parity_check_bytes > self.descrambler.queue_max_bytes {
            errors.push("descrambler: parity_check_bytes exceeds queue_max_bytes".to_string());
        }
        let mut names = std::collections::HashSet::new();
        for client in &self.clients {
            client.validate_into(&mut errors);
            if !names.insert(client.name()) {
                errors.push(format!("{}: duplicate client name", client.name()));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
