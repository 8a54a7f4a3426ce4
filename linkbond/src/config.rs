// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration file handling.
//!
//! The file is TOML: a `[general]` table and one `[tunnel.<name>]` table
//! per link. The pre-shared password lives in the file, so the file must
//! not be readable by group or others.

use linkbond_core::{CoreConfig, TunnelConfig};
use serde::Deserialize;
use std::{collections::BTreeMap, fs, io, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("config file is group/other accessible")]
    Permissions,
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no password configured")]
    MissingPassword,
    #[error("tunnel {0}: cannot initialize socket without bindport")]
    MissingBindPort(String),
    #[error("tunnel {0}: cannot initialize socket without remotehost or remoteport")]
    MissingRemote(String),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Client,
    Server,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct General {
    /// Name of the tun interface
    pub interface: String,
    pub mode: Mode,
    /// Pre-shared secret protecting every frame
    pub password: String,
    /// Send DATA payloads unsealed (control traffic stays protected)
    pub cleartext_data: bool,
    /// Restore TCP ordering across tunnels
    pub reorder_buffer: bool,
    /// Default keepalive timeout, seconds
    pub timeout: u32,
    /// Script run on interface and link state changes
    pub statuscommand: Option<String>,
    pub mtu: Option<u32>,
    pub ip4: Option<String>,
    pub ip6: Option<String>,
    pub ip4_gateway: Option<String>,
    pub ip6_gateway: Option<String>,
    pub ip4_routes: Vec<String>,
    pub ip6_routes: Vec<String>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            interface: "linkbond0".to_string(),
            mode: Mode::default(),
            password: String::new(),
            cleartext_data: false,
            reorder_buffer: true,
            timeout: 60,
            statuscommand: None,
            mtu: None,
            ip4: None,
            ip6: None,
            ip4_gateway: None,
            ip6_gateway: None,
            ip4_routes: Vec::new(),
            ip6_routes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSection {
    pub bindaddr: Option<String>,
    pub bindport: Option<u16>,
    pub binddev: Option<String>,
    pub bindfib: u32,
    pub remotehost: Option<String>,
    pub remoteport: Option<u16>,
    /// Link capacity in kbit/s; 0 enables automatic adjustment
    pub bandwidth_upload: u64,
    /// Loss percentage at which the link is declared lossy
    pub loss_tolerence: Option<u32>,
    /// Bytes per second this link may consume; 0 = unlimited
    pub quota: u64,
    /// Initial tolerated reordering depth
    pub reorder_length: u32,
    /// Keepalive timeout override, seconds
    pub timeout: Option<u32>,
    pub fallback_only: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub tunnel: BTreeMap<String, TunnelSection>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let metadata = fs::metadata(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if metadata.mode() & 0o077 != 0 {
                return Err(Error::Permissions);
            }
        }
        let _ = metadata;
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.general.password.is_empty() {
            return Err(Error::MissingPassword);
        }
        for (name, tunnel) in &self.tunnel {
            match self.general.mode {
                Mode::Server => {
                    if tunnel.bindport.is_none() {
                        return Err(Error::MissingBindPort(name.clone()));
                    }
                }
                Mode::Client => {
                    if tunnel.remotehost.is_none() || tunnel.remoteport.is_none() {
                        return Err(Error::MissingRemote(name.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            secret: self.general.password.clone(),
            cleartext_data: self.general.cleartext_data,
            reorder: self.general.reorder_buffer,
        }
    }

    /// Tunnel configs in name order, so identical files produce identical
    /// tunnel sets
    pub fn tunnel_configs(&self) -> Vec<TunnelConfig> {
        let server_mode = self.general.mode == Mode::Server;
        self.tunnel
            .iter()
            .map(|(name, t)| TunnelConfig {
                name: name.clone(),
                server_mode,
                bind_addr: t.bindaddr.clone(),
                bind_port: t.bindport,
                bind_dev: t.binddev.clone(),
                bind_fib: t.bindfib,
                dest_addr: t.remotehost.clone(),
                dest_port: t.remoteport,
                bandwidth_max: t.bandwidth_upload,
                loss_tolerence: t.loss_tolerence.unwrap_or(50),
                quota: t.quota,
                reorder_length: t.reorder_length,
                timeout: t.timeout.unwrap_or(self.general.timeout),
                fallback_only: t.fallback_only,
            })
            .collect()
    }
}

/// Parses a `--permitted tunnel:value[bkm]` preset
pub fn parse_permitted(arg: &str) -> Result<(String, i64), String> {
    let (name, value) = arg
        .split_once(':')
        .ok_or_else(|| format!("invalid permitted spec {arg:?}, expected tunnel:value[bkm]"))?;
    if name.is_empty() {
        return Err(format!("invalid permitted spec {arg:?}, missing tunnel name"));
    }

    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b'b') => (&value[..value.len() - 1], 1),
        Some(b'k') => (&value[..value.len() - 1], 1_000),
        Some(b'm') => (&value[..value.len() - 1], 1_000_000),
        _ => (value, 1),
    };
    let amount: i64 = digits
        .parse()
        .map_err(|_| format!("invalid permitted value {value:?}"))?;
    Ok((name.to_string(), amount * multiplier))
}
