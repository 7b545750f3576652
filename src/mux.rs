//! The multiplexer: address→auth and address→gate resolution, the shared
//! connection cache, and the idle reaper.
//!
//! A [`Mux`] owns at most one live [`Agent`] per address. `dial` returns
//! non-owning handles onto cached connections, transparently dialing
//! through the configured gate (bastion) host, which is itself dialed and
//! cached on demand, chaining further gates as needed. A background
//! task evicts connections that have sat unreferenced for the keepalive
//! interval.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::auth::Auth;
use crate::error::{Error, Result};
use crate::matcher::{registry, Matcher};

/// Default idle interval before an unreferenced connection is reaped.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 300;

/// Multiplexer configuration.
///
/// `agent_auths` and `agent_gates` are keyed by `kind:pattern` match rules
/// (see [`crate::matcher`]); a key without `:` is a `plain` rule.
/// `agent_auths` values name entries of `auth_methods`; `agent_gates`
/// values are `host:port` gate addresses.
#[derive(Default, Deserialize)]
#[serde(default)]
pub struct MuxAuth {
    pub auth_methods: HashMap<String, Auth>,
    /// Auth id used when no `agent_auths` rule matches.
    pub default_auth: Option<String>,
    pub agent_auths: HashMap<String, String>,
    pub agent_gates: HashMap<String, String>,
    /// Idle interval in seconds before unreferenced connections are
    /// reaped; unset means 300.
    pub keep_alive_secs: Option<u64>,
}

impl MuxAuth {
    fn default_id(&self) -> Option<&str> {
        self.default_auth.as_deref().filter(|s| !s.is_empty())
    }

    /// Checks that every referenced auth id exists and that every auth
    /// descriptor builds a transport configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = self.default_id() {
            if !self.auth_methods.contains_key(id) {
                return Err(Error::NoAuthMethod);
            }
        } else if self.agent_auths.is_empty() {
            return Err(Error::NoAuthMethod);
        }

        for id in self.agent_auths.values() {
            if !self.auth_methods.contains_key(id) {
                return Err(Error::NoAuthMethod);
            }
        }

        for auth in self.auth_methods.values() {
            auth.validate()?;
        }
        Ok(())
    }
}

struct MatcherEntry {
    matcher: Matcher,
    priority: i32,
    value: String,
}

fn compile_rules(rules: &HashMap<String, String>, skip_empty: bool) -> Result<Vec<MatcherEntry>> {
    let mut entries = Vec::with_capacity(rules.len());
    for (rule, value) in rules {
        if skip_empty && value.is_empty() {
            continue;
        }
        let (matcher, priority) = registry().build(rule)?;
        entries.push(MatcherEntry {
            matcher,
            priority,
            value: value.clone(),
        });
    }
    // Descending priority; order within one priority is unspecified.
    entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(entries)
}

struct MuxInner {
    closed: AtomicBool,
    auth_methods: HashMap<String, Auth>,
    default_auth: Option<String>,
    auths: Vec<MatcherEntry>,
    gates: Vec<MatcherEntry>,
    conns: RwLock<HashMap<String, Agent>>,
    /// Single-slot wake channel; dropped on close to stop the reaper.
    wake: Mutex<Option<mpsc::Sender<()>>>,
    idle: Duration,
}

/// Handle to one multiplexer. Cheap to clone; all clones share the cache.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<MuxInner>,
}

impl Mux {
    /// Validates the configuration, compiles the match rules and starts
    /// the idle reaper.
    pub fn new(auth: MuxAuth) -> Result<Mux> {
        auth.validate()?;

        let gates = compile_rules(&auth.agent_gates, true)?;
        let auths = compile_rules(&auth.agent_auths, false)?;
        let idle = Duration::from_secs(auth.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS));

        let (wake_tx, wake_rx) = mpsc::channel(1);
        let inner = Arc::new(MuxInner {
            closed: AtomicBool::new(false),
            default_auth: auth.default_id().map(str::to_string),
            auth_methods: auth.auth_methods,
            auths,
            gates,
            conns: RwLock::new(HashMap::new()),
            wake: Mutex::new(Some(wake_tx)),
            idle,
        });

        tokio::spawn(reap_loop(Arc::downgrade(&inner), wake_rx, idle));

        Ok(Mux { inner })
    }

    /// Gate address for `addr`, from the highest-priority matching rule.
    pub fn agent_gate(&self, addr: &str) -> Option<String> {
        self.inner
            .gates
            .iter()
            .find(|entry| (entry.matcher)(addr))
            .map(|entry| entry.value.clone())
    }

    /// Auth descriptor for `addr`: the highest-priority matching rule, or
    /// the default auth when none matches.
    pub fn agent_auth(&self, addr: &str) -> Result<Auth> {
        let id = self
            .inner
            .auths
            .iter()
            .find(|entry| (entry.matcher)(addr))
            .map(|entry| entry.value.as_str())
            .or(self.inner.default_auth.as_deref())
            .ok_or(Error::NoAuthMethod)?;
        self.inner
            .auth_methods
            .get(id)
            .cloned()
            .ok_or(Error::NoAuthMethod)
    }

    /// Returns a non-owning handle to the connection for `addr`, dialing
    /// it (through its gate, if one is configured) on a cache miss. At
    /// most one underlying connection per address survives concurrent
    /// calls.
    pub async fn dial(&self, addr: &str) -> Result<Agent> {
        self.dial_boxed(addr.to_string()).await
    }

    // Gate chaining makes this recursive: an uncached gate goes through
    // the same resolution, and may itself sit behind a further gate.
    fn dial_boxed(&self, addr: String) -> Pin<Box<dyn Future<Output = Result<Agent>> + Send>> {
        let mux = self.clone();
        Box::pin(async move {
            if mux.inner.closed.load(Ordering::SeqCst) {
                return Err(Error::MuxClosed);
            }

            let gate_addr = mux.agent_gate(&addr);
            let mut gate: Option<Agent> = None;
            {
                let conns = mux.inner.conns.read();
                if let Some(agent) = conns.get(&addr) {
                    return Ok(agent.nop_close());
                }
                if let Some(gate_addr) = &gate_addr {
                    if let Some(cached) = conns.get(gate_addr) {
                        gate = Some(cached.nop_close());
                    }
                }
            }

            if gate.is_none() {
                if let Some(gate_addr) = &gate_addr {
                    gate = Some(mux.dial_boxed(gate_addr.clone()).await?);
                }
            }

            let result = mux.dial_through(&addr, gate.as_ref()).await;

            // The gate handle only had to outlive the child dial.
            if let Some(gate) = gate {
                gate.close().await;
            }
            result
        })
    }

    async fn dial_through(&self, addr: &str, gate: Option<&Agent>) -> Result<Agent> {
        let auth = self.agent_auth(addr)?;
        let agent = match gate {
            Some(gate) => gate.dial_via(addr, &auth).await?,
            None => Agent::dial(addr, &auth).await?,
        };
        self.adopt(addr, agent).await
    }

    /// Inserts a freshly-dialed connection, yielding to a racing winner.
    async fn adopt(&self, addr: &str, agent: Agent) -> Result<Agent> {
        let (handle, loser) = {
            let mut conns = self.inner.conns.write();
            if self.inner.closed.load(Ordering::SeqCst) {
                // Entries may only be inserted while the mux is open.
                (None, Some(agent))
            } else if let Some(existing) = conns.get(addr) {
                debug!(%addr, "lost insertion race, reusing cached connection");
                (Some(existing.nop_close()), Some(agent))
            } else {
                let handle = agent.nop_close();
                conns.insert(addr.to_string(), agent);
                info!(%addr, "connection cached");
                self.wake_reaper();
                (Some(handle), None)
            }
        };

        if let Some(loser) = loser {
            loser.close().await;
        }
        handle.ok_or(Error::MuxClosed)
    }

    fn wake_reaper(&self) {
        let wake = self.inner.wake.lock();
        if let Some(tx) = wake.as_ref() {
            // Single-slot and level-triggered: one pending wake is enough,
            // extra signals are dropped.
            let _ = tx.try_send(());
        }
    }

    /// Number of cached connections.
    pub fn cached(&self) -> usize {
        self.inner.conns.read().len()
    }

    /// Closes the mux: stops the reaper and closes every cached
    /// connection. Idempotent; `dial` returns [`Error::MuxClosed`]
    /// afterwards.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut wake = self.inner.wake.lock();
            *wake = None;
        }
        let drained: Vec<Agent> = {
            let mut conns = self.inner.conns.write();
            conns.drain().map(|(_, agent)| agent).collect()
        };
        for agent in drained {
            agent.close().await;
        }
        info!("mux closed");
    }
}

fn collect_idle(inner: &MuxInner, idle: Duration) -> (Vec<Agent>, bool) {
    let now = Instant::now();
    let mut conns = inner.conns.write();
    let expired: Vec<String> = conns
        .iter()
        .filter(|(_, agent)| {
            agent.refs() <= 0 && now.duration_since(agent.opened_at()) >= idle
        })
        .map(|(addr, _)| addr.clone())
        .collect();

    let mut evicted = Vec::with_capacity(expired.len());
    for addr in expired {
        if let Some(agent) = conns.remove(&addr) {
            debug!(%addr, "reaping idle connection");
            evicted.push(agent);
        }
    }
    let has_live = !conns.is_empty();
    (evicted, has_live)
}

async fn reap_loop(inner: Weak<MuxInner>, mut wake: mpsc::Receiver<()>, idle: Duration) {
    let mut deadline = Instant::now() + idle;
    let mut armed = true;
    loop {
        if armed {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let Some(inner) = inner.upgrade() else { return };
                    let (evicted, has_live) = collect_idle(&inner, idle);
                    drop(inner);
                    // Connections are closed outside the cache lock.
                    for agent in evicted {
                        agent.close().await;
                    }
                    if has_live {
                        deadline = Instant::now() + idle;
                    } else {
                        armed = false;
                    }
                }
                msg = wake.recv() => {
                    match msg {
                        // A wake while the timer is armed is drained
                        // without touching the in-flight deadline.
                        Some(()) => {}
                        None => {
                            warn!("reaper stopping");
                            return;
                        }
                    }
                }
            }
        } else {
            // Cache is empty; sleep until an insertion re-arms the timer.
            match wake.recv().await {
                Some(()) => {
                    deadline = Instant::now() + idle;
                    armed = true;
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_auth(user: &str) -> Auth {
        Auth::with_user(user).password("pw")
    }

    fn mux_with_gates(gates: &[(&str, &str)]) -> Mux {
        let auth = MuxAuth {
            auth_methods: HashMap::from([("default".to_string(), password_auth("root"))]),
            default_auth: Some("default".to_string()),
            agent_gates: gates
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        Mux::new(auth).unwrap()
    }

    #[tokio::test]
    async fn gate_resolution_honours_priorities() {
        let mux = mux_with_gates(&[
            ("ipnet:127.0.0.0/16", "ipnet"),
            ("plain:127.0.0.1:22", "plain"),
            (r"regexp:127.0.0.\d+:\d+", "regexp"),
        ]);

        assert_eq!(mux.agent_gate("127.0.0.1:22").as_deref(), Some("plain"));
        assert_eq!(mux.agent_gate("127.0.0.2:22").as_deref(), Some("regexp"));
        assert_eq!(mux.agent_gate("127.0.1.3:22").as_deref(), Some("ipnet"));
        assert_eq!(mux.agent_gate("10.0.0.1:22"), None);
    }

    #[tokio::test]
    async fn empty_gate_values_are_skipped() {
        let mux = mux_with_gates(&[("plain:a", ""), ("plain:b", "gate:22")]);
        assert_eq!(mux.agent_gate("a"), None);
        assert_eq!(mux.agent_gate("b").as_deref(), Some("gate:22"));
    }

    #[tokio::test]
    async fn gate_and_auth_inheritance() {
        let auth = MuxAuth {
            auth_methods: HashMap::from([
                ("netFoo".to_string(), password_auth("foo")),
                ("netBar".to_string(), password_auth("bar")),
            ]),
            default_auth: Some("netFoo".to_string()),
            agent_gates: HashMap::from([
                ("ipnet:192.168.1.0/24".to_string(), "10.0.1.1:22".to_string()),
                ("ipnet:192.168.2.0/24".to_string(), "10.0.2.1:22".to_string()),
            ]),
            agent_auths: HashMap::from([
                ("plain:10.0.1.1".to_string(), "netFoo".to_string()),
                ("ipnet:192.168.1.0/24".to_string(), "netFoo".to_string()),
                ("plain:10.0.2.1".to_string(), "netBar".to_string()),
                ("ipnet:192.168.2.0/24".to_string(), "netBar".to_string()),
            ]),
            ..Default::default()
        };
        let mux = Mux::new(auth).unwrap();

        let cases = [
            ("10.0.1.1", None, "foo"),
            ("192.168.1.255", Some("10.0.1.1:22"), "foo"),
            ("192.168.2.1", Some("10.0.2.1:22"), "bar"),
            ("192.168.3.1", None, "foo"),
        ];
        for (addr, gate, user) in cases {
            assert_eq!(mux.agent_gate(addr).as_deref(), gate, "gate for {}", addr);
            assert_eq!(mux.agent_auth(addr).unwrap().user, user, "auth for {}", addr);
        }
    }

    #[tokio::test]
    async fn validation_rejects_broken_configs() {
        // Unknown default id.
        let auth = MuxAuth {
            default_auth: Some("missing".to_string()),
            ..Default::default()
        };
        assert!(matches!(Mux::new(auth), Err(Error::NoAuthMethod)));

        // No default and no per-agent rules.
        assert!(matches!(Mux::new(MuxAuth::default()), Err(Error::NoAuthMethod)));

        // Rule referencing an unknown auth id.
        let auth = MuxAuth {
            auth_methods: HashMap::from([("a".to_string(), password_auth("x"))]),
            default_auth: Some("a".to_string()),
            agent_auths: HashMap::from([("plain:h".to_string(), "nope".to_string())]),
            ..Default::default()
        };
        assert!(matches!(Mux::new(auth), Err(Error::NoAuthMethod)));

        // Auth with no credential source.
        let auth = MuxAuth {
            auth_methods: HashMap::from([("a".to_string(), Auth::with_user("x"))]),
            default_auth: Some("a".to_string()),
            ..Default::default()
        };
        assert!(matches!(Mux::new(auth), Err(Error::NoAuthMethod)));
    }

    #[tokio::test]
    async fn bad_rules_surface_at_construction() {
        let base = || MuxAuth {
            auth_methods: HashMap::from([("a".to_string(), password_auth("x"))]),
            default_auth: Some("a".to_string()),
            ..Default::default()
        };

        // A raw host:port key parses its host as an unregistered kind.
        let mut auth = base();
        auth.agent_gates
            .insert("127.0.0.1:22".to_string(), "g:22".to_string());
        assert!(matches!(Mux::new(auth), Err(Error::UnknownRuleKind(_))));

        let mut auth = base();
        auth.agent_gates
            .insert("regexp:(".to_string(), "g:22".to_string());
        assert!(matches!(Mux::new(auth), Err(Error::BadPattern { .. })));

        let mut auth = base();
        auth.agent_auths
            .insert("ipnet:nonsense".to_string(), "a".to_string());
        assert!(matches!(Mux::new(auth), Err(Error::BadPattern { .. })));
    }

    #[tokio::test]
    async fn agent_auth_without_match_or_default_fails() {
        let auth = MuxAuth {
            auth_methods: HashMap::from([("a".to_string(), password_auth("x"))]),
            agent_auths: HashMap::from([("plain:known".to_string(), "a".to_string())]),
            ..Default::default()
        };
        let mux = Mux::new(auth).unwrap();
        assert_eq!(mux.agent_auth("known").unwrap().user, "x");
        assert!(matches!(mux.agent_auth("unknown"), Err(Error::NoAuthMethod)));
    }

    #[tokio::test]
    async fn dial_after_close_fails() {
        let mux = mux_with_gates(&[]);
        mux.close().await;
        assert!(matches!(mux.dial("1.2.3.4:22").await, Err(Error::MuxClosed)));
        // Idempotent.
        mux.close().await;
    }

    #[tokio::test]
    async fn adopt_is_single_winner() {
        let mux = mux_with_gates(&[]);

        let first = Agent::local_only().unwrap();
        let second = Agent::local_only().unwrap();

        let h1 = mux.adopt("race:22", first).await.unwrap();
        let h2 = mux.adopt("race:22", second).await.unwrap();
        assert_eq!(mux.cached(), 1);

        // Both handles are non-owning views of the first connection.
        assert_eq!(h1.status().1, 2);
        assert_eq!(h2.status().1, 2);

        h1.close().await;
        h2.close().await;
        mux.close().await;
        assert_eq!(mux.cached(), 0);
    }

    #[tokio::test]
    async fn adopt_on_closed_mux_refuses_entry() {
        let mux = mux_with_gates(&[]);
        mux.close().await;
        let agent = Agent::local_only().unwrap();
        assert!(matches!(
            mux.adopt("x:22", agent).await,
            Err(Error::MuxClosed)
        ));
        assert_eq!(mux.cached(), 0);
    }

    #[tokio::test]
    async fn cached_connection_is_shared() {
        let mux = mux_with_gates(&[]);
        let agent = Agent::local_only().unwrap();
        let h = mux.adopt("shared:22", agent).await.unwrap();

        // A dial for the cached address takes the fast path without any
        // network activity.
        let h2 = mux.dial("shared:22").await.unwrap();
        assert_eq!(h2.status().1, 2);

        h.close().await;
        h2.close().await;
        mux.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_are_reaped_and_timer_rearms() {
        let auth = MuxAuth {
            auth_methods: HashMap::from([("a".to_string(), password_auth("x"))]),
            default_auth: Some("a".to_string()),
            keep_alive_secs: Some(1),
            ..Default::default()
        };
        let mux = Mux::new(auth).unwrap();

        let handle = mux.adopt("idle:22", Agent::local_only().unwrap()).await.unwrap();
        handle.close().await; // refs drop to zero
        assert_eq!(mux.cached(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mux.cached(), 0, "idle connection reaped within one tick");

        // A fresh insert wakes the suspended reaper and re-arms the timer.
        let handle = mux.adopt("idle:22", Agent::local_only().unwrap()).await.unwrap();
        handle.close().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mux.cached(), 0, "reaper evicts after re-arm");

        mux.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wake_while_armed_keeps_the_deadline() {
        let auth = MuxAuth {
            auth_methods: HashMap::from([("a".to_string(), password_auth("x"))]),
            default_auth: Some("a".to_string()),
            keep_alive_secs: Some(10),
            ..Default::default()
        };
        let mux = Mux::new(auth).unwrap();

        let idle_handle = mux.adopt("idle:22", Agent::local_only().unwrap()).await.unwrap();
        idle_handle.close().await; // refs drop to zero, countdown running

        // An insertion for a different, busy address mid-countdown wakes
        // the reaper but must not postpone the idle entry's deadline.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let busy_handle = mux.adopt("busy:22", Agent::local_only().unwrap()).await.unwrap();
        assert_eq!(mux.cached(), 2);

        // Five more seconds puts us just past the original ten-second
        // deadline; the idle connection is gone, the busy one is not.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mux.cached(), 1, "idle entry reaped within one idle period");
        let again = mux.dial("busy:22").await.unwrap();
        assert_eq!(busy_handle.status().1, 2, "busy entry still cached");

        again.close().await;
        busy_handle.close().await;
        mux.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn referenced_connections_survive_the_reaper() {
        let auth = MuxAuth {
            auth_methods: HashMap::from([("a".to_string(), password_auth("x"))]),
            default_auth: Some("a".to_string()),
            keep_alive_secs: Some(1),
            ..Default::default()
        };
        let mux = Mux::new(auth).unwrap();

        let handle = mux.adopt("busy:22", Agent::local_only().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mux.cached(), 1, "referenced connection stays cached");

        handle.close().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mux.cached(), 0);
        mux.close().await;
    }
}
