//! In-memory doubles for the kernel, firewall and service manager, and a
//! [`TestNode`] wiring them to an in-memory database.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use ovsnet_core::{Cancellation, RetryPolicy};
use ovsnet_ovsdb::testing::{settle, MemoryOvsdb};
use ovsnet_ovsdb::{sync, ContextCache, DbCache, SyncHandle, TableUpdates};

use crate::bridge::BridgeManager;
use crate::firewall::Firewall;
use crate::gateway::{GatewayCoordinator, ServiceManager};
use crate::netlink::{InterfaceAddress, LinkOps};
use crate::watcher;

pub const GATEWAY_SCRIPT: &str = "/usr/sbin/ovsopt.sh";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    pub up: bool,
    pub addresses: Vec<InterfaceAddress>,
    pub peer: Option<String>,
}

#[derive(Default)]
struct LinkState {
    links: BTreeMap<String, FakeLink>,
    failing: HashSet<&'static str>,
    /// links that only show up once the bridge with the same name is polled this often
    hidden_polls: BTreeMap<String, u32>,
    ignore_addresses: bool,
}

/// Kernel links held in memory
#[derive(Default)]
pub struct FakeLinks {
    state: Mutex<LinkState>,
}

impl FakeLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, name: &str) {
        lock(&self.state)
            .links
            .insert(name.to_string(), FakeLink::default());
    }

    /// `name` appears only after it has been looked for `polls` times.
    pub fn add_link_after(&self, name: &str, polls: u32) {
        lock(&self.state).hidden_polls.insert(name.to_string(), polls);
    }

    /// Make every call of `op` fail. `op` is the method name, e.g. "set_up".
    pub fn fail(&self, op: &'static str) {
        lock(&self.state).failing.insert(op);
    }

    /// Accept `add_address` without actually storing the address.
    pub fn drop_addresses(&self) {
        lock(&self.state).ignore_addresses = true;
    }

    pub fn set_address(&self, name: &str, address: &str, prefix_len: u8) {
        let mut state = lock(&self.state);
        let link = state.links.entry(name.to_string()).or_default();
        link.addresses = vec![InterfaceAddress {
            address: address.parse().unwrap_or(IpAddr::from([0, 0, 0, 0])),
            prefix_len,
        }];
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        lock(&self.state).links.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.state).links.keys().cloned().collect()
    }

    fn check(&self, op: &'static str) -> Result<MutexGuard<'_, LinkState>> {
        let state = lock(&self.state);
        if state.failing.contains(op) {
            return Err(anyhow!("injected {} failure", op));
        }
        Ok(state)
    }
}

#[async_trait]
impl LinkOps for FakeLinks {
    async fn list_links(&self) -> Result<Vec<String>> {
        let mut state = self.check("list_links")?;
        let mut appeared = Vec::new();
        for (name, polls) in state.hidden_polls.iter_mut() {
            if *polls <= 1 {
                appeared.push(name.clone());
            } else {
                *polls -= 1;
            }
        }
        for name in appeared {
            state.hidden_polls.remove(&name);
            state.links.insert(name, FakeLink::default());
        }
        Ok(state.links.keys().cloned().collect())
    }

    async fn addresses(&self, name: &str) -> Result<Vec<InterfaceAddress>> {
        let state = self.check("addresses")?;
        state
            .links
            .get(name)
            .map(|l| l.addresses.clone())
            .ok_or_else(|| anyhow!("Interface '{}' not found", name))
    }

    async fn add_address(&self, name: &str, address: IpAddr, prefix_len: u8) -> Result<()> {
        let mut state = self.check("add_address")?;
        let ignore = state.ignore_addresses;
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| anyhow!("Interface '{}' not found", name))?;
        if !ignore {
            link.addresses.push(InterfaceAddress {
                address,
                prefix_len,
            });
        }
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        let mut state = self.check("set_up")?;
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| anyhow!("Interface '{}' not found", name))?;
        link.up = true;
        Ok(())
    }

    async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        let mut state = self.check("create_veth")?;
        if state.links.contains_key(name) || state.links.contains_key(peer) {
            return Err(anyhow!("File exists (EEXIST)"));
        }
        for (a, b) in [(name, peer), (peer, name)] {
            state.links.insert(
                a.to_string(),
                FakeLink {
                    peer: Some(b.to_string()),
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.check("delete_link")?;
        let link = state
            .links
            .remove(name)
            .ok_or_else(|| anyhow!("Interface '{}' not found", name))?;
        if let Some(peer) = link.peer {
            state.links.remove(&peer);
        }
        Ok(())
    }
}

/// Firewall that remembers masqueraded sources
#[derive(Default)]
pub struct FakeFirewall {
    rules: Mutex<Vec<String>>,
    failing: Mutex<bool>,
}

impl FakeFirewall {
    pub fn rules(&self) -> Vec<String> {
        lock(&self.rules).clone()
    }

    pub fn fail(&self) {
        *lock(&self.failing) = true;
    }
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn ensure_masquerade(&self, cidr: &str) -> Result<bool> {
        if *lock(&self.failing) {
            return Err(anyhow!("iptables: No chain/target/match by that name"));
        }
        let mut rules = lock(&self.rules);
        if rules.iter().any(|r| r == cidr) {
            return Ok(false);
        }
        rules.push(cidr.to_string());
        Ok(true)
    }
}

#[derive(Default)]
struct ServiceState {
    running: bool,
    started: Vec<String>,
    stops: u32,
    fail_start: bool,
    fail_stop: bool,
}

/// Service manager tracking a single gateway process
#[derive(Default)]
pub struct FakeServices {
    state: Mutex<ServiceState>,
}

impl FakeServices {
    /// Pretend a gateway process was started outside the driver.
    pub fn set_running(&self, running: bool) {
        lock(&self.state).running = running;
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Command lines passed to `start_gateway`, in order.
    pub fn started(&self) -> Vec<String> {
        lock(&self.state).started.clone()
    }

    pub fn stops(&self) -> u32 {
        lock(&self.state).stops
    }

    pub fn fail_start(&self) {
        lock(&self.state).fail_start = true;
    }

    pub fn fail_stop(&self) {
        lock(&self.state).fail_stop = true;
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn gateway_running(&self) -> Result<bool> {
        Ok(lock(&self.state).running)
    }

    async fn start_gateway(&self, command: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.started.push(command.to_string());
        if state.fail_start {
            return Err(anyhow!("systemctl start linkerGateway.service failed"));
        }
        state.running = true;
        Ok(())
    }

    async fn stop_gateway(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.stops += 1;
        if state.fail_stop {
            return Err(anyhow!("systemctl stop linkerGateway.service failed"));
        }
        state.running = false;
        Ok(())
    }
}

/// A synchronized cache over [`MemoryOvsdb`] and a [`BridgeManager`] on fakes.
/// Forwarded batches are queued for [`TestNode::reconcile`] instead of a
/// background watcher, so tests decide when reconciliation runs.
pub struct TestNode {
    pub db: Arc<MemoryOvsdb>,
    pub cache: DbCache,
    pub sync: SyncHandle,
    pub links: Arc<FakeLinks>,
    pub firewall: Arc<FakeFirewall>,
    pub services: Arc<FakeServices>,
    pub bridges: Arc<BridgeManager>,
    forwarded: mpsc::UnboundedReceiver<Arc<TableUpdates>>,
}

impl TestNode {
    pub async fn start() -> Self {
        let db = Arc::new(MemoryOvsdb::new());
        let cache = DbCache::new();
        let (forward, forwarded) = mpsc::unbounded_channel();
        let sync = match sync::start(
            db.clone(),
            cache.clone(),
            &ContextCache::new(),
            Some(forward),
            &RetryPolicy::new(10, Duration::from_millis(5)),
            &Cancellation::never(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => panic!("synchronizer failed to start: {}", e),
        };

        let links = Arc::new(FakeLinks::new());
        let firewall = Arc::new(FakeFirewall::default());
        let services = Arc::new(FakeServices::default());
        let gateway = Arc::new(GatewayCoordinator::new(services.clone(), GATEWAY_SCRIPT));
        let bridges = Arc::new(BridgeManager::new(
            db.clone(),
            cache.clone(),
            links.clone(),
            firewall.clone(),
            gateway,
            RetryPolicy::new(3, Duration::from_millis(1)),
            Cancellation::never(),
        ));

        Self {
            db,
            cache,
            sync,
            links,
            firewall,
            services,
            bridges,
            forwarded,
        }
    }

    /// Wait until the cache holds everything the database published.
    pub async fn settle(&self) {
        settle(&self.db, &self.sync).await;
    }

    /// Settle and feed every forwarded batch to the watcher, until reconciling
    /// causes no further updates.
    pub async fn reconcile(&mut self) {
        loop {
            self.settle().await;
            let mut handled = false;
            while let Ok(batch) = self.forwarded.try_recv() {
                watcher::handle_batch(&self.bridges, &batch).await;
                handled = true;
            }
            if !handled {
                break;
            }
        }
    }
}
