// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Status script invocation.
//!
//! The configured command runs on interface and per-link state changes
//! with `(interface, event [, tunnel])` as arguments and the address plan
//! in the environment: `IP4`, `IP6`, `IP4_GATEWAY`, `IP6_GATEWAY`,
//! `IP4_ROUTES`, `IP6_ROUTES`, `DEVICE`, `MTU`.

use crate::config::General;
use tracing::{debug, info, warn};

pub struct ScriptRunner {
    command: Option<String>,
    device: String,
    env: Vec<(&'static str, String)>,
}

impl ScriptRunner {
    pub fn new(general: &General, device: &str, mtu: usize) -> Self {
        let env = vec![
            ("IP4", general.ip4.clone().unwrap_or_default()),
            ("IP6", general.ip6.clone().unwrap_or_default()),
            (
                "IP4_GATEWAY",
                general.ip4_gateway.clone().unwrap_or_default(),
            ),
            (
                "IP6_GATEWAY",
                general.ip6_gateway.clone().unwrap_or_default(),
            ),
            ("IP4_ROUTES", general.ip4_routes.join(" ")),
            ("IP6_ROUTES", general.ip6_routes.join(" ")),
            ("DEVICE", device.to_string()),
            ("MTU", mtu.to_string()),
        ];
        Self {
            command: general.statuscommand.clone(),
            device: device.to_string(),
            env,
        }
    }

    /// Runs the status command for an event (`tuntap_up`, `tuntap_down`,
    /// `rtun_up`, `rtun_down`)
    pub fn run(&self, event: &str, tunnel: Option<&str>) {
        let command = match &self.command {
            Some(command) => command,
            None => {
                debug!(event, "no status command configured");
                return;
            }
        };

        let mut invocation = tokio::process::Command::new(command);
        invocation.arg(&self.device).arg(event);
        if let Some(tunnel) = tunnel {
            invocation.arg(tunnel);
        }
        invocation.envs(self.env.iter().map(|(k, v)| (*k, v.as_str())));

        debug!(command, event, ?tunnel, "running status command");
        match invocation.spawn() {
            Ok(mut child) => {
                // reap in the background, the loop never waits on scripts
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(err) => warn!(command, %err, "status command failed to start"),
        }
    }

    /// Resolver state changed under us (config reload)
    pub fn reload_resolver(&self) {
        debug!("resolver reload requested");
    }

    /// Startup finished; let the service manager know
    pub fn set_running_state(&self) {
        info!("running");
    }
}
