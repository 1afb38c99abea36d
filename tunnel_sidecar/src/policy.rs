//! Egress policy around the tunnel.
//!
//! Every privileged step degrades instead of failing: a rule the host refuses
//! is logged, remembered as a lost guarantee and skipped. Whatever was
//! actually installed is tracked so [`PolicyApplier::restore`] can undo it.

use crate::facility::{
    ChainPolicy, DefaultRoute, FacilityError, FirewallFacility, FirewallRule, IpFamily,
};
use ipnet::IpNet;
use shared_utils::config::PolicyConfig;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const FAMILIES: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

#[derive(Debug, Default)]
struct PolicyState {
    /// Default route seen before the tunnel existed
    original_route: Option<DefaultRoute>,
    /// Rules this process installed, in installation order
    rules: Vec<FirewallRule>,
    routes: Vec<IpNet>,
    locked: Vec<IpFamily>,
    resolver_backup: Option<String>,
    degraded: Vec<String>,
}

/// Outcome of [`PolicyApplier::restore`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub failures: Vec<String>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct PolicyApplier {
    firewall: Arc<dyn FirewallFacility>,
    config: PolicyConfig,
    state: Mutex<PolicyState>,
}

impl PolicyApplier {
    pub fn new(firewall: Arc<dyn FirewallFacility>, config: PolicyConfig) -> Self {
        Self {
            firewall,
            config,
            state: Mutex::new(PolicyState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, PolicyState> {
        // A poisoned lock only means a panic elsewhere; the bookkeeping is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn degrade(&self, what: &str, err: &FacilityError) {
        if err.is_permission_denied() {
            warn!(
                "{} requires privileges this process lacks ({}); continuing without it",
                what, err
            );
        } else {
            warn!("{} failed ({}); continuing without it", what, err);
        }
        self.state().degraded.push(format!("{}: {}", what, err));
    }

    /// Guarantees that could not be established.
    pub fn degraded(&self) -> Vec<String> {
        self.state().degraded.clone()
    }

    pub fn is_degraded(&self) -> bool {
        !self.state().degraded.is_empty()
    }

    /// Insert a rule unless an identical one is present. Returns whether the
    /// rule is in place afterwards.
    async fn ensure_rule(&self, rule: FirewallRule, at_top: bool) -> bool {
        match self.firewall.rule_exists(&rule).await {
            Ok(true) => {
                debug!("Rule already present: {}", rule);
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                self.degrade(&format!("checking rule `{}`", rule), &e);
                return false;
            }
        }

        let result = if at_top {
            self.firewall.insert_rule(&rule).await
        } else {
            self.firewall.append_rule(&rule).await
        };
        match result {
            Ok(()) => {
                self.state().rules.push(rule);
                true
            }
            Err(e) => {
                self.degrade(&format!("adding rule `{}`", rule), &e);
                false
            }
        }
    }

    /// Remember the pre-tunnel default route. Later calls return the cached value.
    pub async fn capture_default_route(&self) -> Option<DefaultRoute> {
        if let Some(route) = self.state().original_route.clone() {
            return Some(route);
        }
        match self.firewall.default_route().await {
            Ok(Some(route)) => {
                info!(
                    "Original default route via {} dev {}",
                    route.gateway, route.device
                );
                self.state().original_route = Some(route.clone());
                Some(route)
            }
            Ok(None) => {
                warn!("No default route found; bypass routes will not be installed");
                None
            }
            Err(e) => {
                self.degrade("reading the default route", &e);
                None
            }
        }
    }

    async fn add_route(&self, destination: IpNet) {
        let Some(via) = self.capture_default_route().await else {
            return;
        };
        if IpFamily::of(&via.gateway) != IpFamily::of_net(&destination) {
            debug!("Skipping route {}: no gateway of that family", destination);
            return;
        }
        match self.firewall.add_route(&destination, &via).await {
            Ok(()) => {
                let mut state = self.state();
                if !state.routes.contains(&destination) {
                    state.routes.push(destination);
                }
            }
            Err(e) => self.degrade(&format!("adding route {}", destination), &e),
        }
    }

    /// Allow egress UDP to the tunnel peer so the handshake survives lockdown.
    pub async fn apply_handshake_exception(&self, peer: IpAddr, port: u16) {
        if !self.config.kill_switch {
            debug!("Kill switch disabled; no handshake exception needed");
            return;
        }
        if self
            .ensure_rule(FirewallRule::allow_udp_peer(peer, port), true)
            .await
        {
            info!("Handshake exception in place for {}:{}", peer, port);
        }
    }

    /// Route the peer through the original gateway so handshake packets do
    /// not try to enter the tunnel they are meant to establish.
    pub async fn apply_peer_route(&self, peer: IpAddr) {
        self.add_route(IpNet::from(peer)).await;
    }

    /// Route the configured internal ranges outside the tunnel.
    pub async fn apply_bypass_routes(&self) {
        if !self.config.bypass_routes {
            info!("Bypass routes disabled");
            return;
        }
        for net in self.config.bypass_networks() {
            self.add_route(net).await;
        }
    }

    /// Default-deny egress, allowing loopback, established flows, the tunnel
    /// interface and (when enabled) the bypass ranges.
    pub async fn lockdown(&self, interface: &str) {
        if !self.config.kill_switch {
            warn!("Kill switch disabled; egress outside the tunnel is not blocked");
            return;
        }

        for family in FAMILIES {
            let mut ok = self
                .ensure_rule(FirewallRule::allow_loopback(family), false)
                .await;
            ok &= self
                .ensure_rule(FirewallRule::allow_established(family), false)
                .await;
            ok &= self
                .ensure_rule(FirewallRule::allow_interface(family, interface), false)
                .await;
            if self.config.bypass_routes {
                for net in self
                    .config
                    .bypass_networks()
                    .into_iter()
                    .filter(|n| IpFamily::of_net(n) == family)
                {
                    self.ensure_rule(FirewallRule::allow_destination(&net), false)
                        .await;
                }
            }

            if !ok {
                // Dropping without the allow rules would cut the tunnel itself
                warn!("{:?} kill switch not enabled: allow rules incomplete", family);
                continue;
            }

            match self
                .firewall
                .set_output_policy(family, ChainPolicy::Drop)
                .await
            {
                Ok(()) => {
                    info!("{:?} egress locked down to {}", family, interface);
                    self.state().locked.push(family);
                }
                Err(e) => self.degrade(&format!("{:?} default-deny policy", family), &e),
            }
        }
    }

    /// Point the resolver at the tunnel's DNS servers, keeping a backup.
    pub async fn rewrite_dns(&self, servers: &[String]) {
        if !self.config.dns_rewrite {
            info!("DNS rewrite disabled");
            return;
        }
        if servers.is_empty() {
            debug!("Tunnel config declares no DNS servers; resolver left unchanged");
            return;
        }

        let path = self.config.resolv_conf_path.as_path();
        let original = match self.firewall.read_resolver(path).await {
            Ok(contents) => contents,
            Err(e) => {
                self.degrade(&format!("reading {}", path.display()), &e);
                return;
            }
        };

        let mut contents = String::from("# Generated by tunnel-sidecar\n");
        for server in servers {
            contents.push_str(&format!("nameserver {}\n", server));
        }

        match self.firewall.write_resolver(path, &contents).await {
            Ok(()) => {
                info!("Resolver now uses tunnel DNS {:?}", servers);
                let mut state = self.state();
                if state.resolver_backup.is_none() {
                    state.resolver_backup = Some(original);
                }
            }
            Err(e) => self.degrade(&format!("writing {}", path.display()), &e),
        }
    }

    /// Undo everything this process installed. Every step runs even when an
    /// earlier one fails; calling it again is a no-op.
    pub async fn restore(&self) -> RestoreReport {
        let (locked, rules, routes, backup) = {
            let mut state = self.state();
            (
                std::mem::take(&mut state.locked),
                std::mem::take(&mut state.rules),
                std::mem::take(&mut state.routes),
                state.resolver_backup.take(),
            )
        };
        let mut report = RestoreReport::default();

        for family in locked {
            if let Err(e) = self
                .firewall
                .set_output_policy(family, ChainPolicy::Accept)
                .await
            {
                warn!("Failed to reset {:?} egress policy: {}", family, e);
                report
                    .failures
                    .push(format!("{:?} policy reset: {}", family, e));
            }
        }

        for rule in rules.iter().rev() {
            if let Err(e) = self.firewall.delete_rule(rule).await {
                warn!("Failed to delete rule {}: {}", rule, e);
                report.failures.push(format!("delete rule `{}`: {}", rule, e));
            }
        }

        for route in routes.iter().rev() {
            if let Err(e) = self.firewall.delete_route(route).await {
                warn!("Failed to delete route {}: {}", route, e);
                report.failures.push(format!("delete route {}: {}", route, e));
            }
        }

        if let Some(backup) = backup {
            let path = self.config.resolv_conf_path.as_path();
            if let Err(e) = self.firewall.write_resolver(path, &backup).await {
                warn!("Failed to restore {}: {}", path.display(), e);
                report
                    .failures
                    .push(format!("restore {}: {}", path.display(), e));
            }
        }

        if report.is_clean() {
            info!("Network policy restored");
        } else {
            warn!(
                "Network policy restored with {} failure(s)",
                report.failures.len()
            );
        }
        report
    }
}
