use std::{error::Error, fmt, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use nfqd_common::DEFAULT_PACKET_SIZE;
use serde::{Deserialize, Serialize};

use crate::conf::conf_serde::duration;

/// Room reserved in the receive buffer for the headers and attributes that
/// accompany each copied payload.
pub const RECV_HEADROOM: usize = 1024;

/// Settings for a single queue instance.
///
/// Loaded with the priority Defaults < Configuration File < Environment
/// Variables (`NFQD_` prefix, e.g. `NFQD_QUEUE_NUM=3`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueConf {
    /// Queue number the firewall rule sends packets to (`--queue-num`).
    /// - Default: 0
    #[serde(default)]
    pub queue_num: u16,

    /// Maximum number of packets the kernel holds for this queue before it
    /// applies its own policy (drop, or accept when fail-open).
    /// - Default: 1024
    #[serde(default = "defaults::max_queue_len")]
    pub max_queue_len: u32,

    /// Number of payload bytes copied to userspace per packet.
    /// - Default: 65535
    #[serde(default = "defaults::packet_size")]
    pub packet_size: u32,

    /// Accept packets instead of dropping them when they cannot be delivered.
    /// - Default: false
    #[serde(default)]
    pub fail_open: bool,

    /// How long `close` waits for kernel teardown before giving up on it.
    /// - Default: 5s
    #[serde(default = "defaults::teardown_timeout", with = "duration")]
    pub teardown_timeout: Duration,

    /// Minimum size of the buffer handed to each receive call. The buffer is
    /// grown to `packet_size + RECV_HEADROOM` when that is larger.
    /// - Default: 4096
    #[serde(default = "defaults::recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Ask the source not to report `ENOBUFS` when the kernel overruns it.
    /// - Default: true
    #[serde(default = "defaults::no_enobufs")]
    pub no_enobufs: bool,
}

impl Default for QueueConf {
    fn default() -> Self {
        Self {
            queue_num: 0,
            max_queue_len: defaults::max_queue_len(),
            packet_size: defaults::packet_size(),
            fail_open: false,
            teardown_timeout: defaults::teardown_timeout(),
            recv_buffer_size: defaults::recv_buffer_size(),
            no_enobufs: defaults::no_enobufs(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    use super::DEFAULT_PACKET_SIZE;

    pub fn max_queue_len() -> u32 {
        1024
    }

    pub fn packet_size() -> u32 {
        DEFAULT_PACKET_SIZE
    }

    pub fn teardown_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn recv_buffer_size() -> usize {
        4096
    }

    pub fn no_enobufs() -> bool {
        true
    }
}

impl QueueConf {
    pub fn new(queue_num: u16) -> Self {
        Self {
            queue_num,
            ..Self::default()
        }
    }

    /// Load the configuration, layering an optional YAML file and the
    /// `NFQD_`-prefixed environment over the defaults.
    ///
    /// # Errors
    /// * `ConfigError::NoConfigFile` - `path` does not exist.
    /// * `ConfigError::InvalidConfigPath` - `path` exists but is not a file.
    /// * `ConfigError::InvalidExtension` - `path` is not `.yaml`/`.yml`.
    /// * `ConfigError::Extraction` - a value failed to parse.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(QueueConf::default()));

        if let Some(path) = path {
            validate_config_path(path)?;
            figment = figment.merge(Yaml::file(path));
        }

        let conf: QueueConf = figment.merge(Env::prefixed("NFQD_")).extract()?;
        conf.validate()?;
        Ok(conf)
    }

    /// Reject values no queue can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "packet_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "recv_buffer_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Bytes allocated for each receive call: large enough that a full
    /// `packet_size` copy plus its headers never fills the buffer.
    pub fn recv_buffer_len(&self) -> usize {
        self.recv_buffer_size
            .max((self.packet_size as usize).saturating_add(RECV_HEADROOM))
    }
}

fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfigError::InvalidConfigPath(
                path.to_string_lossy().into_owned(),
            ));
        } else {
            return Err(ConfigError::NoConfigFile);
        }
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfigError::InvalidExtension(ext.to_string())),
        None => Err(ConfigError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// The specified configuration file does not exist.
    NoConfigFile,
    /// The path exists but is not a file.
    InvalidConfigPath(String),
    /// The file has an unsupported extension.
    InvalidExtension(String),
    /// Failed to extract configuration data.
    Extraction(Box<figment::Error>),
    /// A value was parsed but is out of range.
    InvalidValue { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoConfigFile => write!(f, "no config file provided"),
            ConfigError::InvalidConfigPath(p) => write!(f, "path '{p}' is not a valid file"),
            ConfigError::InvalidExtension(ext) => {
                write!(
                    f,
                    "invalid file extension '.{ext}', expected 'yaml' or 'yml'"
                )
            }
            ConfigError::Extraction(e) => write!(f, "configuration error: {e}"),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "invalid value for '{field}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Extraction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Extraction(Box::from(e))
    }
}

pub mod conf_serde {
    pub mod duration {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        }
    }
}
