//! FORWARD chain orchestration
//!
//! [`Forwarder`] is the single entry point for mutating the ruleset. It owns
//! the last peer list, the allowlist manager and the enabled flag, and holds
//! one lock for the whole of every operation so no two resyncs interleave.
//!
//! # Lifecycle
//!
//! ```text
//! Disabled --enable--> Enabled --disable--> Disabled
//!                      |     ^
//!                      +-----+ reset_peers / reset_firewall
//! ```
//!
//! A resync never patches: it clears every transient rule and rebuilds from the
//! inputs. A failed resync may leave the chain half built; running it again
//! converges.

use crate::core::allowlist::{AllowlistManager, reset_allowlist_rules};
use crate::core::baseline::enable_filtering;
use crate::core::composer::{ForwardPolicy, compose};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::executor::{CommandExecutor, Iptables};
use crate::core::introspect::clear_rules;
use crate::core::kernel::SysctlSetter;
use crate::core::masquerade::{clear_masquerading, enable_masquerading};
use crate::core::model::{FirewallSettings, Peer, TrafficPeer};
use crate::core::rule::{Chain, Tag};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Operations the daemon drives on session and policy changes.
pub trait ForwardChainManager: Send + Sync {
    /// Turns on kernel forwarding and installs the baseline.
    fn enable(&self) -> Result<()>;

    /// Stores `peers` and rebuilds every transient rule.
    fn reset_peers(&self, peers: Vec<Peer>, settings: &FirewallSettings) -> Result<()>;

    /// Rebuilds using the stored peers. While disabled only allowlist rules change.
    fn reset_firewall(&self, settings: &FirewallSettings) -> Result<()>;

    /// Removes every owned rule and restores kernel forwarding, best effort.
    fn disable(&self) -> Result<()>;
}

struct State<K> {
    sysctl: K,
    peers: Vec<Peer>,
    allowlist: AllowlistManager,
    enabled: bool,
}

pub struct Forwarder<E, K> {
    iptables: Iptables<E>,
    /// Interfaces captured at construction; kill switch rules are bound to them
    interfaces: Vec<String>,
    state: Mutex<State<K>>,
}

impl<E: CommandExecutor, K: SysctlSetter> Forwarder<E, K> {
    pub fn new(executor: E, interfaces: Vec<String>, sysctl: K) -> Self {
        Self {
            iptables: Iptables::new(executor),
            interfaces,
            state: Mutex::new(State {
                sysctl,
                peers: Vec::new(),
                allowlist: AllowlistManager::new(),
                enabled: false,
            }),
        }
    }

    pub fn iptables(&self) -> &Iptables<E> {
        &self.iptables
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.lock()?.enabled)
    }

    /// Peers stored by the last `reset_peers`.
    pub fn peers(&self) -> Result<Vec<Peer>> {
        Ok(self.lock()?.peers.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State<K>>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("forwarder state lock poisoned".to_string()))
    }

    fn resync(&self, state: &mut State<K>, settings: &FirewallSettings) -> Result<()> {
        let ipt = &self.iptables;
        let peers = TrafficPeer::from_peers(&state.peers, settings.lan_available);
        let subnets = settings.allowlist.ipv4_subnets();
        let policy = ForwardPolicy {
            interfaces: &self.interfaces,
            kill_switch: settings.kill_switch,
            allowlist_enabled: settings.allowlist_enabled,
            allowlist_subnets: &subnets,
        };

        clear_masquerading(ipt).context("clearing masquerade rules")?;
        // allowlist accepts go first so no peer briefly gains access a removed
        // block rule was constraining
        clear_rules(
            ipt,
            Chain::Forward,
            &[Tag::AllowlistTransient, Tag::ExitnodeTransient],
        )
        .context("clearing exitnode forward rules")?;

        let plan = compose(&peers, &policy);
        plan.apply(ipt).context("resetting peers traffic")?;
        enable_masquerading(ipt, &peers).context("enabling masquerading")?;

        state
            .allowlist
            .disable(ipt)
            .context("disabling peer allowlist")?;
        state.allowlist.set_allowlist(settings.allowlist.clone());

        // without full LAN access, local peers still reach allow-listed destinations
        if !settings.lan_available {
            state.allowlist.set_peers(state.peers.clone());
            state
                .allowlist
                .enable(ipt)
                .context("enabling peer allowlist")?;
        }

        info!(
            "resynced {} peer(s): {} forward rule(s)",
            peers.len(),
            plan.len()
        );
        Ok(())
    }
}

impl<E: CommandExecutor, K: SysctlSetter> ForwardChainManager for Forwarder<E, K> {
    fn enable(&self) -> Result<()> {
        let mut state = self.lock()?;
        info!("enabling mesh forwarding");

        state
            .sysctl
            .set()
            .context("enabling ipv4 forwarding")
            .inspect_err(|e| error!("{e}"))?;
        enable_filtering(&self.iptables)
            .context("enabling filtering")
            .inspect_err(|e| error!("{e}"))?;

        state.enabled = true;
        Ok(())
    }

    fn reset_peers(&self, peers: Vec<Peer>, settings: &FirewallSettings) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.peers = peers;
        self.resync(state, settings)
            .inspect_err(|e| error!("resetting peers: {e}"))
    }

    fn reset_firewall(&self, settings: &FirewallSettings) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        if state.enabled {
            return self
                .resync(state, settings)
                .context("resetting peers")
                .inspect_err(|e| error!("{e}"));
        }

        state
            .allowlist
            .disable(&self.iptables)
            .context("disabling peer allowlist")?;
        reset_allowlist_rules(
            &self.iptables,
            &self.interfaces,
            settings.kill_switch,
            settings.allowlist_enabled,
            &settings.allowlist.ipv4_subnets(),
        )
        .context("resetting allowlist rules")
    }

    fn disable(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let ipt = &self.iptables;
        info!("disabling mesh forwarding");

        let mut errors = Vec::new();
        let mut attempt = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!("{step}: {e}");
                errors.push(e.context(step));
            }
        };

        attempt(
            "clearing filtering",
            clear_rules(
                ipt,
                Chain::Forward,
                &[
                    Tag::AllowlistTransient,
                    Tag::ExitnodeTransient,
                    Tag::ExitnodePermanent,
                ],
            )
            .map(drop),
        );
        attempt("clearing masquerading", clear_masquerading(ipt).map(drop));
        attempt("disabling allowlist", state.allowlist.disable(ipt).map(drop));
        attempt("unsetting the forwarding value", state.sysctl.unset());

        // peers survive: the next enable + reset_firewall rebuilds from them
        state.enabled = false;

        if errors.is_empty() {
            Ok(())
        } else {
            error!("teardown finished with {} error(s)", errors.len());
            Err(Error::Teardown(errors))
        }
    }
}
