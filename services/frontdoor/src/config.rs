//! Command line and JSON config file.
//!
//! A config file is a JSON object keyed by long flag names. Its entries are
//! turned into `--key value` arguments and placed before the real command
//! line, so flags given on the command line win.

use std::ffi::OsString;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use onedoor_whitelist::split_list;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;

use crate::backend::admin::{AdminConfig, Credentials};
use crate::backend::BackendConfig;
use crate::mux::MuxConfig;
use crate::startup::FrontDoorConfig;

/// Characters used for generated admin passwords.
pub const PASSWORD_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ123456789";

/// Length of generated admin passwords.
pub const PASSWORD_LEN: usize = 10;

/// Flags that take no value; `true` in a config file becomes the bare flag.
const SWITCHES: [&str; 2] = ["verbose", "log-json"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Args(#[from] clap::Error),

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("config file {} must contain a JSON object", path.display())]
    NotAnObject { path: PathBuf },

    #[error("unsupported value for config key {key:?}")]
    UnsupportedValue { key: String },
}

/// SOCKS5/HTTP proxy with built-in management server, on a single port.
#[derive(Debug, Clone, Parser)]
#[command(name = "onedoor", version, about, args_override_self = true)]
pub struct Cli {
    /// JSON config file (same as --config)
    #[arg(value_name = "CONFIG")]
    pub config_file: Option<PathBuf>,

    /// JSON config file whose keys are long flag names
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Comma-separated addresses allowed to connect (empty means any)
    #[arg(short = 'w', long, value_name = "LIST", default_value = "")]
    pub whitelist: String,

    /// File with allowed addresses, one per line
    #[arg(short = 'W', long = "whitelist-file", value_name = "PATH")]
    pub whitelist_file: Option<PathBuf>,

    /// Persist admin changes into the whitelist file
    #[arg(long, value_name = "BOOL", default_value_t = true, action = ArgAction::Set)]
    pub persist: bool,

    /// Public port
    #[arg(long, default_value_t = 8818)]
    pub mux_port: u16,

    /// Public bind address
    #[arg(long, default_value = "0.0.0.0")]
    pub mux_address: IpAddr,

    /// Admin backend port (0 picks a free port)
    #[arg(long, default_value_t = 0)]
    pub admin_port: u16,

    /// Admin backend bind address
    #[arg(long, default_value = "127.0.0.1")]
    pub admin_address: IpAddr,

    /// Static files served by the admin backend
    #[arg(short = 's', long = "static", value_name = "PATH", default_value = "./static")]
    pub static_dir: PathBuf,

    /// Admin Basic-Auth username
    #[arg(long, default_value = "admin")]
    pub username: String,

    /// Admin Basic-Auth password (generated on each start when omitted)
    #[arg(long)]
    pub password: Option<String>,

    /// TLS private key (PEM)
    #[arg(long = "ssl-key", alias = "sslkey", value_name = "PATH", default_value = "./ssl/server.key")]
    pub ssl_key: PathBuf,

    /// TLS certificate chain (PEM)
    #[arg(long = "ssl-cert", alias = "sslcert", value_name = "PATH", default_value = "./ssl/server.crt")]
    pub ssl_cert: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Parse `args`, merging in the config file if one is named.
    pub fn try_load_from<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let cli = Self::try_parse_from(&args)?;

        let Some(path) = cli.config_path().map(Path::to_path_buf) else {
            return Ok(cli);
        };

        let mut merged = Vec::with_capacity(args.len());
        let mut rest = args.into_iter();
        merged.extend(rest.next());
        merged.extend(config_file_args(&path)?.into_iter().map(OsString::from));
        merged.extend(rest);

        Ok(Self::try_parse_from(merged)?)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref().or(self.config_file.as_deref())
    }

    /// Entries given with `-w`.
    pub fn whitelist_entries(&self) -> Vec<String> {
        split_list(&self.whitelist)
    }

    pub fn mux_addr(&self) -> SocketAddr {
        SocketAddr::new(self.mux_address, self.mux_port)
    }

    pub fn admin_addr(&self) -> SocketAddr {
        SocketAddr::new(self.admin_address, self.admin_port)
    }

    /// The configured password, or a freshly generated one. The flag tells
    /// whether it was generated.
    pub fn password_or_generate(&self) -> (String, bool) {
        match &self.password {
            Some(password) => (password.clone(), false),
            None => (generate_password(), true),
        }
    }

    pub fn front_door_config(&self, password: String) -> FrontDoorConfig {
        let mut admin = AdminConfig::new(
            &self.ssl_cert,
            &self.ssl_key,
            Credentials::new(self.username.clone(), password),
        );
        admin.bind_addr = self.admin_addr();
        admin.static_dir = self.static_dir.clone();
        admin.persist = self.persist;

        FrontDoorConfig {
            mux: MuxConfig::new(self.mux_addr()),
            socks: BackendConfig::loopback(),
            http: BackendConfig::loopback(),
            admin,
        }
    }
}

/// Random password of [`PASSWORD_LEN`] characters from [`PASSWORD_CHARS`].
pub fn generate_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_CHARS[rng.random_range(0..PASSWORD_CHARS.len())] as char)
        .collect()
}

/// Remove `//` comments that start a line or follow whitespace.
pub fn strip_comments(source: &str) -> String {
    source
        .lines()
        .map(|line| {
            let cut = line
                .match_indices("//")
                .map(|(i, _)| i)
                .find(|&i| i == 0 || line[..i].ends_with(char::is_whitespace));
            match cut {
                Some(i) => line[..i].trim_end(),
                None => line,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read a config file and turn it into command line arguments.
pub fn config_file_args(path: &Path) -> Result<Vec<String>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value =
        serde_json::from_str(&strip_comments(&contents)).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let Value::Object(options) = value else {
        return Err(ConfigError::NotAnObject {
            path: path.to_path_buf(),
        });
    };

    let mut args = Vec::new();
    for (key, value) in options {
        if key == "config" {
            continue;
        }
        let flag = if key.chars().count() == 1 {
            format!("-{key}")
        } else {
            format!("--{key}")
        };

        let value = match value {
            Value::Null => continue,
            Value::Bool(enabled) if SWITCHES.contains(&key.as_str()) => {
                if enabled {
                    args.push(flag);
                }
                continue;
            }
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s,
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    _ => Err(ConfigError::UnsupportedValue { key: key.clone() }),
                })
                .collect::<Result<Vec<_>, _>>()?
                .join(","),
            Value::Object(_) => return Err(ConfigError::UnsupportedValue { key }),
        };
        args.push(flag);
        args.push(value);
    }
    Ok(args)
}
