//! Runtime virtual-host state and round-robin backend selection
//!
//! A [`Backend`] is the runtime form of a configured server: a forwarding
//! target plus, for fan-out virtual hosts, a rotation list of balancing
//! members. Member list, rotation cursor and health state share one mutex
//! so a health update is visible to the next selection on the same host.

use crate::config::{resolve_url, ServerSpec};
use crate::forward::ForwardTarget;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Backend selection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// The virtual host has no balancing members configured
    Empty,
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectError::Empty => write!(f, "no backend servers configured"),
        }
    }
}

impl std::error::Error for SelectError {}

struct BackendState {
    healthy: bool,
    last_health_check: Option<DateTime<Utc>>,
    members: Vec<Arc<Backend>>,
    /// Rotation cursor; starts at the final index so the first advance
    /// wraps to 0
    cursor: usize,
}

/// Runtime state for a virtual host or balancing member
pub struct Backend {
    pub name: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub url: String,
    pub force_tls: bool,
    state: Mutex<BackendState>,
    target: OnceLock<ForwardTarget>,
}

impl Backend {
    /// Build the runtime backend tree for a configured server.
    pub fn from_spec(spec: &ServerSpec) -> Self {
        let members: Vec<Arc<Backend>> = spec
            .balance
            .iter()
            .map(|m| Arc::new(Backend::from_spec(m)))
            .collect();
        let cursor = members.len().saturating_sub(1);
        Self {
            name: spec.name.clone(),
            protocol: spec.protocol.clone(),
            host: spec.host.clone(),
            port: spec.port,
            url: spec.url.clone(),
            force_tls: spec.force_tls,
            state: Mutex::new(BackendState {
                healthy: spec.is_healthy,
                last_health_check: None,
                members,
                cursor,
            }),
            target: OnceLock::new(),
        }
    }

    /// The canonical forwarding URL for this backend.
    pub fn resolved_url(&self) -> anyhow::Result<String> {
        resolve_url(&self.url, &self.protocol, &self.host, self.port)
    }

    /// Parsed forwarding target, memoized after the first successful parse.
    pub fn target(&self) -> anyhow::Result<&ForwardTarget> {
        if let Some(target) = self.target.get() {
            return Ok(target);
        }
        let parsed = ForwardTarget::parse(&self.resolved_url()?)?;
        Ok(self.target.get_or_init(|| parsed))
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    /// Record a health-check outcome together with its timestamp.
    pub fn record_health(&self, healthy: bool, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.healthy = healthy;
        state.last_health_check = Some(at);
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_health_check
    }

    /// Snapshot of the balancing members; checks run outside the lock.
    pub fn members(&self) -> Vec<Arc<Backend>> {
        self.state.lock().members.clone()
    }

    pub fn has_members(&self) -> bool {
        !self.state.lock().members.is_empty()
    }

    pub fn add_member(&self, member: Arc<Backend>) {
        self.state.lock().members.push(member);
    }

    pub fn remove_member(&self, name: &str) {
        self.state.lock().members.retain(|m| m.name != name);
    }

    pub fn member(&self, name: &str) -> Option<Arc<Backend>> {
        self.state
            .lock()
            .members
            .iter()
            .find(|m| m.name == name)
            .cloned()
    }

    /// Replace the whole balancing set atomically.
    pub fn rollback(&self, members: Vec<Arc<Backend>>) {
        self.state.lock().members = members;
    }

    /// Replace the member with the given name, or append when the name is
    /// empty.
    pub fn rollback_any(&self, name: &str, replacement: Arc<Backend>) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if name.is_empty() {
            state.members.push(replacement);
            return Ok(());
        }
        for slot in state.members.iter_mut() {
            if slot.name == name {
                *slot = replacement;
                return Ok(());
            }
        }
        anyhow::bail!("server named {:?} not found", name)
    }

    /// Round-robin selection with health bias.
    ///
    /// Advances the cursor and scans at most one full rotation for a healthy
    /// member. When every member is unhealthy the member at the final cursor
    /// position is returned anyway so a total outage surfaces as upstream
    /// errors rather than a black hole.
    pub fn next_member(&self) -> Result<Arc<Backend>, SelectError> {
        let mut state = self.state.lock();
        let n = state.members.len();
        if n == 0 {
            return Err(SelectError::Empty);
        }
        for _ in 0..n {
            state.cursor = (state.cursor + 1) % n;
            let candidate = Arc::clone(&state.members[state.cursor]);
            if candidate.is_healthy() {
                return Ok(candidate);
            }
        }
        Ok(Arc::clone(&state.members[state.cursor]))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, url: &str, healthy: bool) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            url: url.to_string(),
            is_healthy: healthy,
            ..Default::default()
        }
    }

    fn fan_out(members: Vec<ServerSpec>) -> Backend {
        Backend::from_spec(&ServerSpec {
            name: "lb".to_string(),
            url: "http://127.0.0.1:9000".to_string(),
            balance: members,
            ..Default::default()
        })
    }

    #[test]
    fn test_first_advance_yields_first_member() {
        let lb = fan_out(vec![
            member("a", "http://127.0.0.1:1", true),
            member("b", "http://127.0.0.1:2", true),
            member("c", "http://127.0.0.1:3", true),
        ]);
        assert_eq!(lb.next_member().unwrap().name, "a");
    }

    #[test]
    fn test_round_robin_rotation() {
        let lb = fan_out(vec![
            member("a", "http://127.0.0.1:1", true),
            member("b", "http://127.0.0.1:2", true),
            member("c", "http://127.0.0.1:3", true),
        ]);
        let picks: Vec<String> = (0..6).map(|_| lb.next_member().unwrap().name.clone()).collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_prefers_healthy() {
        let lb = fan_out(vec![
            member("a", "http://127.0.0.1:1", false),
            member("b", "http://127.0.0.1:2", true),
            member("c", "http://127.0.0.1:3", false),
        ]);
        for _ in 0..5 {
            let got = lb.next_member().unwrap();
            assert!(got.is_healthy());
            assert_eq!(got.name, "b");
        }

        // Once another member recovers it joins the rotation again.
        lb.member("a").unwrap().set_healthy(true);
        let names: Vec<String> = (0..4).map(|_| lb.next_member().unwrap().name.clone()).collect();
        assert!(names.contains(&"a".to_string()));
        assert!(!names.contains(&"c".to_string()));
    }

    #[test]
    fn test_all_unhealthy_degraded_mode() {
        let lb = fan_out(vec![
            member("a", "http://127.0.0.1:1", false),
            member("b", "http://127.0.0.1:2", false),
        ]);
        // A full scan finds nothing healthy; the final cursor member comes
        // back so the caller surfaces the upstream error.
        let got = lb.next_member().unwrap();
        assert!(!got.is_healthy());
    }

    #[test]
    fn test_empty_members_fails_closed() {
        let lb = fan_out(vec![]);
        assert_eq!(lb.next_member().unwrap_err(), SelectError::Empty);
    }

    #[test]
    fn test_rollback_replaces_set() {
        let lb = fan_out(vec![member("a", "http://127.0.0.1:1", true)]);
        lb.rollback(vec![
            Arc::new(Backend::from_spec(&member("x", "http://127.0.0.1:8", true))),
            Arc::new(Backend::from_spec(&member("y", "http://127.0.0.1:9", true))),
        ]);
        assert!(lb.member("a").is_none());
        assert_eq!(lb.members().len(), 2);
    }

    #[test]
    fn test_rollback_any() {
        let lb = fan_out(vec![
            member("a", "http://127.0.0.1:1", true),
            member("b", "http://127.0.0.1:2", true),
        ]);

        let replacement = Arc::new(Backend::from_spec(&member("b", "http://127.0.0.1:7", true)));
        lb.rollback_any("b", replacement).unwrap();
        assert_eq!(lb.member("b").unwrap().url, "http://127.0.0.1:7");

        // Empty name appends.
        let extra = Arc::new(Backend::from_spec(&member("c", "http://127.0.0.1:3", true)));
        lb.rollback_any("", extra).unwrap();
        assert_eq!(lb.members().len(), 3);

        let missing = Arc::new(Backend::from_spec(&member("z", "http://127.0.0.1:4", true)));
        assert!(lb.rollback_any("nope", missing).is_err());
    }

    #[test]
    fn test_add_remove_member() {
        let lb = fan_out(vec![member("a", "http://127.0.0.1:1", true)]);
        lb.add_member(Arc::new(Backend::from_spec(&member(
            "b",
            "http://127.0.0.1:2",
            true,
        ))));
        assert_eq!(lb.members().len(), 2);
        lb.remove_member("a");
        assert_eq!(lb.members().len(), 1);
        assert!(lb.member("b").is_some());
    }

    #[test]
    fn test_record_health_updates_timestamp() {
        let backend = Backend::from_spec(&member("a", "http://127.0.0.1:1", true));
        assert!(backend.last_health_check().is_none());
        backend.record_health(false, Utc::now());
        assert!(!backend.is_healthy());
        assert!(backend.last_health_check().is_some());
    }

    #[test]
    fn test_target_memoized() {
        let backend = Backend::from_spec(&member("a", "http://127.0.0.1:1234", true));
        let first = backend.target().unwrap() as *const ForwardTarget;
        let second = backend.target().unwrap() as *const ForwardTarget;
        assert_eq!(first, second);
        assert_eq!(backend.target().unwrap().scheme, "http");
    }
}
