//! Command line arguments, with `MULTIPROXY_*` environment fallbacks, and the
//! plain server configuration they resolve to.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};

use crate::{logger::LogLevel, manager::SessionSettings};

/// Protocol spoken on the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Mode {
    #[default]
    Http,
    Socks5,
    /// Forward every connection to `--target-host:--target-port`.
    Tun,
}

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "HTTP CONNECT, SOCKS5 and tunnel proxy with optional mutual TLS"
)]
pub struct CliArgs {
    /// Address to listen on
    #[arg(long, env = "MULTIPROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "MULTIPROXY_PORT", default_value_t = 8443)]
    pub port: u16,

    /// Proxy protocol
    #[arg(short, long, env = "MULTIPROXY_MODE", value_enum, default_value_t = Mode::Http)]
    pub mode: Mode,

    /// Log level, overridden by RUST_LOG
    #[arg(short = 'v', long, env = "MULTIPROXY_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Also append logs to this file
    #[arg(short = 'l', long, env = "MULTIPROXY_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Terminate TLS on accepted connections, requiring client certificates
    #[arg(short, long, env = "MULTIPROXY_TLS")]
    pub tls: bool,

    /// PEM private key of the server certificate
    #[arg(short = 'k', long, env = "MULTIPROXY_PRIVATE_KEY", help_heading = "TLS")]
    pub private_key: Option<PathBuf>,

    /// PEM server certificate chain
    #[arg(short = 's', long, env = "MULTIPROXY_SERVER_CERT", help_heading = "TLS")]
    pub server_cert: Option<PathBuf>,

    /// PEM CA certificates trusted for client authentication
    #[arg(short = 'c', long, env = "MULTIPROXY_CA_CERT", help_heading = "TLS")]
    pub ca_cert: Option<PathBuf>,

    /// Upstream host for tunnel mode
    #[arg(long, env = "MULTIPROXY_TARGET_HOST", help_heading = "Tunnel")]
    pub target_host: Option<String>,

    /// Upstream port for tunnel mode
    #[arg(long, env = "MULTIPROXY_TARGET_PORT", help_heading = "Tunnel")]
    pub target_port: Option<String>,

    /// Allow SOCKS5 UDP ASSOCIATE
    #[arg(long, env = "MULTIPROXY_UDP_ASSOCIATE")]
    pub udp_associate: bool,
}

/// Certificate material for mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub private_key: PathBuf,
    pub server_cert: PathBuf,
    pub ca_cert: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: String,
    pub mode: Mode,
    pub tls: Option<TlsFiles>,
    pub target: Option<(String, String)>,
    pub udp_associate: bool,
}

impl ServerConfig {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            target: self.target.clone(),
            udp_associate: self.udp_associate,
        }
    }
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("listen host must not be empty"));
        }

        if self.tls {
            let files = [
                ("--private-key", &self.private_key),
                ("--server-cert", &self.server_cert),
                ("--ca-cert", &self.ca_cert),
            ];
            for (flag, path) in files {
                let path = path
                    .as_deref()
                    .ok_or_else(|| anyhow!("TLS mode requires {flag}"))?;
                check_file(path).with_context(|| format!("invalid {flag}"))?;
            }
        }

        if self.mode == Mode::Tun {
            match (&self.target_host, &self.target_port) {
                (Some(host), Some(port)) if !host.is_empty() && !port.is_empty() => {}
                _ => {
                    return Err(anyhow!(
                        "tun mode requires --target-host and --target-port"
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn into_server_config(self) -> ServerConfig {
        let listen = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };

        let tls = match (self.tls, self.private_key, self.server_cert, self.ca_cert) {
            (true, Some(private_key), Some(server_cert), Some(ca_cert)) => Some(TlsFiles {
                private_key,
                server_cert,
                ca_cert,
            }),
            _ => None,
        };

        let target = match self.mode {
            Mode::Tun => self.target_host.zip(self.target_port),
            _ => None,
        };

        ServerConfig {
            listen,
            mode: self.mode,
            tls,
            target,
            udp_associate: self.udp_associate,
        }
    }
}

fn check_file(path: &Path) -> Result<()> {
    let metadata =
        std::fs::metadata(path).with_context(|| format!("{} not found", path.display()))?;
    if !metadata.is_file() {
        return Err(anyhow!("{} is not a file", path.display()));
    }
    Ok(())
}
