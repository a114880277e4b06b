//! Driver configuration and appliance credentials.
//!
//! Configuration comes entirely from the environment (see [`Config::from_env`]
//! for the recognized keys). Credentials live in a small YAML file and are
//! re-read on every RPC so they can be rotated without restarting the driver.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::CsiError;

const DEFAULT_LOG_LEVEL: u8 = 3;
const DEFAULT_CERT_PATH: &str = "/mnt/certs/zfssa.crt";
const DEFAULT_CRED_PATH: &str = "/mnt/zfssa/zfssa.yaml";

const USERNAME_LENGTH: usize = 255;

static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_\-\.]*$").unwrap_or_else(|e| panic!("username pattern: {e}"))
});

fn is_username_valid(username: &str) -> bool {
    !username.is_empty() && username.len() <= USERNAME_LENGTH && USERNAME_RE.is_match(username)
}

/// Runtime configuration of the driver process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Appliance hostname or address.
    pub appliance: String,
    /// Identity of the node this container runs on.
    pub node_name: String,
    /// Filesystem path of the UNIX socket the driver listens on.
    pub endpoint: PathBuf,
    /// When false, appliance certificate verification is disabled.
    pub secure: bool,
    /// PEM bundle contents, present when `secure`.
    pub certificate: Option<Vec<u8>>,
    /// Path of the YAML credentials file.
    pub cred_path: PathBuf,
    pub host_ip: String,
    pub pod_ip: String,
    /// Verbosity, 1 (errors only) through 5 (trace).
    pub log_level: u8,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// Recognized variables:
    ///
    /// | Variable         | Meaning                                        |
    /// |------------------|------------------------------------------------|
    /// | `ZFSSA_TARGET`   | appliance hostname (required)                  |
    /// | `NODE_NAME`      | this node's identity (required)                |
    /// | `CSI_ENDPOINT`   | `unix://` socket address (required)            |
    /// | `ZFSSA_INSECURE` | `true` disables certificate checks             |
    /// | `ZFSSA_CERT`     | PEM bundle path (default `/mnt/certs/zfssa.crt`) |
    /// | `ZFSSA_CRED`     | credentials path (default `/mnt/zfssa/zfssa.yaml`) |
    /// | `HOST_IP`        | self-report only                               |
    /// | `POD_IP`         | self-report only                               |
    /// | `LOG_LEVEL`      | 1..=5, default 3                               |
    pub fn from_env() -> Result<Self, CsiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, CsiError> {
        let cred_path = get("ZFSSA_CRED")
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CRED_PATH.to_owned());
        let cred_path = PathBuf::from(cred_path);
        if !cred_path.exists() {
            return Err(CsiError::InvalidArgument(format!(
                "the appliance credentials file is not present at {}",
                cred_path.display()
            )));
        }
        // The credentials file must parse before the driver comes up.
        read_credentials(&cred_path)?;

        let appliance = get("ZFSSA_TARGET")
            .map(|v| v.trim().to_owned())
            .unwrap_or_default();
        if appliance.is_empty() {
            return Err(CsiError::InvalidArgument(
                "an appliance name is required (ZFSSA_TARGET)".into(),
            ));
        }

        let node_name = get("NODE_NAME").unwrap_or_default();
        if node_name.is_empty() {
            return Err(CsiError::InvalidArgument(
                "a node name is required (NODE_NAME)".into(),
            ));
        }

        let endpoint = get("CSI_ENDPOINT").unwrap_or_default();
        let endpoint = endpoint
            .strip_prefix("unix://")
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| {
                CsiError::InvalidArgument(
                    "the endpoint is required and must begin with unix:// (CSI_ENDPOINT)".into(),
                )
            })?;
        let endpoint = PathBuf::from(format!("/{}", endpoint.trim_start_matches('/')));

        let secure = match get("ZFSSA_INSECURE")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "false".to_owned())
            .as_str()
        {
            "true" => false,
            "false" => true,
            other => {
                return Err(CsiError::InvalidArgument(format!(
                    "ZFSSA_INSECURE value is invalid ({other})"
                )))
            }
        };

        let certificate = if secure {
            let cert_path = get("ZFSSA_CERT")
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CERT_PATH.to_owned());
            let pem = std::fs::read(&cert_path).map_err(|e| {
                CsiError::InvalidArgument(format!(
                    "failed to read the appliance certificate at {cert_path}: {e}"
                ))
            })?;
            Some(pem)
        } else {
            None
        };

        let log_level = match get("LOG_LEVEL") {
            None => DEFAULT_LOG_LEVEL,
            Some(raw) => match raw.trim().parse::<u8>() {
                Ok(level @ 1..=5) => level,
                _ => {
                    return Err(CsiError::InvalidArgument(format!(
                        "invalid log level ({raw})"
                    )))
                }
            },
        };

        Ok(Config {
            appliance,
            node_name,
            endpoint,
            secure,
            certificate,
            cred_path,
            host_ip: get("HOST_IP").unwrap_or_else(|| "0.0.0.0".to_owned()),
            pod_ip: get("POD_IP").unwrap_or_else(|| "0.0.0.0".to_owned()),
            log_level,
        })
    }
}

/// Appliance login credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Reads and validates the YAML credentials file. Called on every RPC so a
/// rotated secret takes effect without a restart.
pub fn read_credentials(path: &std::path::Path) -> Result<Credentials, CsiError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CsiError::Unauthenticated(format!(
            "the credentials file {} could not be read: {e}",
            path.display()
        ))
    })?;
    let creds: Credentials = serde_yaml::from_str(&raw).map_err(|e| {
        CsiError::Unauthenticated(format!(
            "the credentials file {} could not be parsed: {e}",
            path.display()
        ))
    })?;
    if !is_username_valid(&creds.username) {
        return Err(CsiError::Unauthenticated(format!(
            "appliance username is invalid ({})",
            creds.username
        )));
    }
    Ok(creds)
}
