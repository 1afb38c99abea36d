//! Tunnel lifecycle: bring-up, liveness, reconnect and teardown.
//!
//! The controller is the only writer of the tunnel state; everyone else reads
//! it through a [`watch`] receiver. Every change is also broadcast as a
//! `(from, to)` pair for observers that need the full sequence.

use super::config_file::{tunnel_mtu, TunnelConfigFile};
use super::types::{TunnelSnapshot, TunnelState};
use crate::error::{SidecarError, SidecarResult};
use crate::facility::TunnelFacility;
use crate::policy::PolicyApplier;
use shared_utils::config::{BackoffMode, TunnelConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Poll step while waiting for the interface to reappear after a reconnect.
const RECONNECT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct PreparedTunnel {
    file: TunnelConfigFile,
    /// Path handed to the tunnel tool
    runtime_path: PathBuf,
}

pub struct TunnelController {
    tunnel: Arc<dyn TunnelFacility>,
    policy: Arc<PolicyApplier>,
    config: TunnelConfig,
    state_tx: watch::Sender<TunnelSnapshot>,
    transitions: broadcast::Sender<(TunnelState, TunnelState)>,
    prepared: Option<PreparedTunnel>,
}

impl TunnelController {
    pub fn new(
        tunnel: Arc<dyn TunnelFacility>,
        policy: Arc<PolicyApplier>,
        config: TunnelConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(TunnelSnapshot::new(config.interface.clone()));
        let (transitions, _) = broadcast::channel(32);
        Self {
            tunnel,
            policy,
            config,
            state_tx,
            transitions,
            prepared: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<(TunnelState, TunnelState)> {
        self.transitions.subscribe()
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        self.state_tx.borrow().clone()
    }

    pub fn state(&self) -> TunnelState {
        self.state_tx.borrow().state
    }

    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    /// The parsed tunnel config, once [`prepare`](Self::prepare) succeeded.
    pub fn config_file(&self) -> Option<&TunnelConfigFile> {
        self.prepared.as_ref().map(|p| &p.file)
    }

    fn set_state(&self, state: TunnelState) {
        let previous = self.state();
        self.state_tx.send_modify(|snapshot| {
            snapshot.state = state;
            if state == TunnelState::Up {
                snapshot.last_up = Some(SystemTime::now());
            }
        });
        if previous != state {
            info!(
                interface = %self.config.interface,
                "Tunnel state {} -> {}", previous, state
            );
            // No subscribers is fine
            let _ = self.transitions.send((previous, state));
        }
    }

    /// Load the tunnel config and write the copy the tunnel tool will use.
    ///
    /// Runs before any network change so a missing or broken config aborts
    /// with nothing to undo.
    pub async fn prepare(&mut self) -> SidecarResult<()> {
        let file = TunnelConfigFile::load(&self.config.config_path)?;
        info!(
            "Loaded tunnel config {} (peer {})",
            self.config.config_path.display(),
            file.endpoint()
        );

        let mtu = if file.mtu().is_some() {
            None
        } else {
            self.base_mtu().await.map(tunnel_mtu)
        };

        let runtime_path =
            match file.write_writable_copy(&self.config.writable_dir, &self.config.interface, mtu) {
                Ok(path) => path,
                Err(e) => {
                    warn!(
                        "Cannot write tunnel config copy ({}); using {} as is",
                        e,
                        self.config.config_path.display()
                    );
                    self.config.config_path.clone()
                }
            };

        let peer = file.endpoint().clone();
        self.state_tx
            .send_modify(|snapshot| snapshot.peer = Some(peer));
        self.prepared = Some(PreparedTunnel { file, runtime_path });
        Ok(())
    }

    async fn base_mtu(&self) -> Option<u32> {
        let route = self.policy.capture_default_route().await?;
        match self.tunnel.interface_mtu(&route.device).await {
            Ok(mtu) => mtu,
            Err(e) => {
                debug!("Cannot read MTU of {}: {}", route.device, e);
                None
            }
        }
    }

    fn runtime_path(&self) -> PathBuf {
        self.prepared
            .as_ref()
            .map(|p| p.runtime_path.clone())
            .unwrap_or_else(|| self.config.config_path.clone())
    }

    /// Bring the tunnel up and wait for the interface to appear.
    pub async fn start(&mut self) -> SidecarResult<()> {
        if self.prepared.is_none() {
            self.prepare().await?;
        }

        if let Some(endpoint) = self.config_file().map(|f| f.endpoint().clone()) {
            match endpoint.resolve().await {
                Ok(ip) => {
                    self.policy.apply_peer_route(ip).await;
                    self.policy
                        .apply_handshake_exception(ip, endpoint.port)
                        .await;
                }
                Err(e) => warn!(
                    "Cannot resolve peer {} ({}); no handshake exception or peer route",
                    endpoint, e
                ),
            }
        }

        self.set_state(TunnelState::BringingUp);
        let path = self.runtime_path();
        if let Err(e) = self.tunnel.bring_up(&path).await {
            warn!("Tunnel bring-up command failed: {}", e);
        }

        for attempt in 1..=self.config.bringup_retries {
            if self.tunnel.interface_exists(&self.config.interface).await {
                info!(
                    interface = %self.config.interface,
                    "Tunnel interface up after {} check(s)", attempt
                );
                self.set_state(TunnelState::Up);
                return Ok(());
            }
            debug!(
                "Waiting for {} ({}/{})",
                self.config.interface, attempt, self.config.bringup_retries
            );
            tokio::time::sleep(self.config.bringup_interval()).await;
        }

        error!(
            interface = %self.config.interface,
            "Tunnel interface did not appear"
        );
        self.set_state(TunnelState::Down);
        Err(SidecarError::BringUpTimeout {
            interface: self.config.interface.clone(),
            attempts: self.config.bringup_retries,
        })
    }

    /// One supervision tick: reconnect if the interface vanished.
    ///
    /// Returns whether a reconnect happened.
    pub async fn check_liveness(&mut self) -> SidecarResult<bool> {
        if !matches!(self.state(), TunnelState::Up | TunnelState::Degraded) {
            return Ok(false);
        }
        if self.tunnel.interface_exists(&self.config.interface).await {
            self.state_tx
                .send_modify(|snapshot| snapshot.last_up = Some(SystemTime::now()));
            return Ok(false);
        }
        warn!(interface = %self.config.interface, "Tunnel interface disappeared");
        self.reconnect().await?;
        Ok(true)
    }

    /// Record that the tunnel is up but failing validation.
    pub fn mark_degraded(&self, reason: &str) {
        if self.state() == TunnelState::Up {
            warn!(interface = %self.config.interface, "Tunnel degraded: {}", reason);
            self.set_state(TunnelState::Degraded);
        }
    }

    /// Settle delay before the given attempt (1-based).
    pub fn settle_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_settle();
        match self.config.reconnect.backoff {
            BackoffMode::Fixed => base,
            BackoffMode::Exponential => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                base.saturating_mul(factor)
                    .min(Duration::from_secs(self.config.reconnect.max_backoff_secs))
            }
        }
    }

    async fn wait_for_interface(&self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if self.tunnel.interface_exists(&self.config.interface).await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(RECONNECT_POLL.min(deadline - now)).await;
        }
    }

    /// Tear down and bring the tunnel back, up to the configured attempts.
    pub async fn reconnect(&mut self) -> SidecarResult<()> {
        let max_attempts = self.config.reconnect.max_attempts;
        let path = self.runtime_path();

        for attempt in 1..=max_attempts {
            self.set_state(TunnelState::Reconnecting);
            info!(
                interface = %self.config.interface,
                "Reconnect attempt {}/{}", attempt, max_attempts
            );

            if let Err(e) = self.tunnel.tear_down(&path).await {
                debug!("Teardown before reconnect failed: {}", e);
            }
            tokio::time::sleep(self.settle_delay(attempt)).await;

            if let Err(e) = self.tunnel.bring_up(&path).await {
                warn!("Tunnel bring-up command failed: {}", e);
            }

            if self.wait_for_interface(self.config.reconnect_wait()).await {
                info!(interface = %self.config.interface, "Tunnel reconnected");
                self.set_state(TunnelState::Up);
                return Ok(());
            }
            warn!(
                interface = %self.config.interface,
                "Interface still missing after reconnect attempt {}", attempt
            );
        }

        self.set_state(TunnelState::Down);
        Err(SidecarError::ReconnectFailed {
            attempts: max_attempts,
            reason: format!("interface {} did not reappear", self.config.interface),
        })
    }

    /// Bring the interface down. A no-op when it is already down.
    pub async fn tear_down(&mut self) -> SidecarResult<()> {
        if self.state() == TunnelState::Down {
            return Ok(());
        }
        let path = self.runtime_path();
        let result = self.tunnel.tear_down(&path).await;
        self.set_state(TunnelState::Down);
        result?;
        Ok(())
    }
}
