//! Reading the tunnel config file and preparing its writable copy.
//!
//! Only what the controller needs is extracted: the peer endpoint, the DNS
//! servers and any explicit MTU. The file itself is handed to the tunnel tool
//! unchanged apart from an optional injected `MTU =` line.

use crate::error::{SidecarError, SidecarResult};
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Smallest MTU allowed on a link carrying IPv6.
pub const MIN_TUNNEL_MTU: u32 = 1280;

/// Encapsulation overhead subtracted from the base interface MTU.
pub const TUNNEL_OVERHEAD: u32 = 80;

/// MTU for the tunnel given the MTU of the interface it rides on.
pub fn tunnel_mtu(base_mtu: u32) -> u32 {
    base_mtu.saturating_sub(TUNNEL_OVERHEAD).max(MIN_TUNNEL_MTU)
}

/// The remote `host:port` the tunnel handshakes with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    /// Resolve the host to an address, preferring a literal IP.
    pub async fn resolve(&self) -> io::Result<IpAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(ip);
        }
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .map(|addr: SocketAddr| addr.ip())
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", self.host),
                )
            })
    }
}

impl FromStr for PeerEndpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| format!("malformed endpoint '{}'", s))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| format!("endpoint '{}' has no port", s))?
        };
        if host.is_empty() {
            return Err(format!("endpoint '{}' has no host", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("endpoint '{}' has an invalid port", s))?;
        Ok(PeerEndpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A parsed tunnel config file.
#[derive(Debug, Clone)]
pub struct TunnelConfigFile {
    path: PathBuf,
    contents: String,
    endpoint: PeerEndpoint,
    dns: Vec<String>,
    mtu: Option<u32>,
}

impl TunnelConfigFile {
    pub fn load<P: AsRef<Path>>(path: P) -> SidecarResult<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SidecarError::TunnelConfigMissing(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(path, contents)
    }

    pub fn parse<P: AsRef<Path>>(path: P, contents: String) -> SidecarResult<Self> {
        let mut section = String::new();
        let mut saw_interface = false;
        let mut endpoint = None;
        let mut dns = Vec::new();
        let mut mtu = None;

        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_ascii_lowercase();
                saw_interface |= section == "interface";
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match (section.as_str(), key.as_str()) {
                ("interface", "dns") => dns.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(String::from),
                ),
                ("interface", "mtu") => {
                    mtu = Some(value.parse::<u32>().map_err(|_| {
                        SidecarError::TunnelConfigInvalid(format!("invalid MTU '{}'", value))
                    })?);
                }
                ("peer", "endpoint") if endpoint.is_none() => {
                    endpoint = Some(
                        value
                            .parse::<PeerEndpoint>()
                            .map_err(SidecarError::TunnelConfigInvalid)?,
                    );
                }
                _ => {}
            }
        }

        if !saw_interface {
            return Err(SidecarError::TunnelConfigInvalid(
                "missing [Interface] section".to_string(),
            ));
        }
        let endpoint = endpoint.ok_or_else(|| {
            SidecarError::TunnelConfigInvalid("no peer Endpoint configured".to_string())
        })?;

        debug!(endpoint = %endpoint, dns = ?dns, mtu = ?mtu, "Parsed tunnel config");

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            contents,
            endpoint,
            dns,
            mtu,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endpoint(&self) -> &PeerEndpoint {
        &self.endpoint
    }

    pub fn dns(&self) -> &[String] {
        &self.dns
    }

    pub fn mtu(&self) -> Option<u32> {
        self.mtu
    }

    /// Contents with an `MTU =` line added under `[Interface]`, unless the
    /// file already sets one.
    pub fn contents_with_mtu(&self, mtu: u32) -> String {
        if self.mtu.is_some() {
            return self.contents.clone();
        }
        let mut out = String::with_capacity(self.contents.len() + 16);
        let mut injected = false;
        for line in self.contents.lines() {
            out.push_str(line);
            out.push('\n');
            if !injected && line.trim().eq_ignore_ascii_case("[interface]") {
                out.push_str(&format!("MTU = {}\n", mtu));
                injected = true;
            }
        }
        out
    }

    /// Write `<dir>/<interface>.conf` for the tunnel tool and return its path.
    ///
    /// The tool names the interface after the file, and refuses
    /// world-readable configs, hence the mode.
    pub fn write_writable_copy(
        &self,
        dir: &Path,
        interface: &str,
        mtu: Option<u32>,
    ) -> SidecarResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let dest = dir.join(format!("{}.conf", interface));
        let contents = match mtu {
            Some(mtu) => self.contents_with_mtu(mtu),
            None => self.contents.clone(),
        };
        fs::write(&dest, contents)?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o600))?;
        info!(
            "Prepared tunnel config {} (MTU {})",
            dest.display(),
            self.mtu
                .or(mtu)
                .map_or_else(|| "auto".to_string(), |m| m.to_string())
        );
        Ok(dest)
    }
}
