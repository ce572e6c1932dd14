//! In-memory fakes for state machine tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::poll::Target;
use crate::probe::{Probe, ProbeOutcome};
use crate::providers::{
    AttachedServer, AttachmentStatus, Inventory, ProviderError, RescueState, Server,
    ServerDetails, VSwitch, VSwitchDetails,
};

/// Mutable state behind [`FakeInventory`].
#[derive(Debug, Default)]
pub struct FakeState {
    pub servers: Vec<Server>,
    pub no_rescue: HashSet<String>,
    pub rescue_active: HashMap<String, bool>,
    /// Password currently reported by the rescue status endpoint.
    pub rescue_passwords: HashMap<String, Option<String>>,
    /// Password returned by the next activation; a generated one otherwise.
    pub activation_passwords: HashMap<String, Option<String>>,
    /// Servers whose rescue flag ignores deactivation.
    pub stuck_active: HashSet<String>,
    pub vswitches: Vec<VSwitchDetails>,
    /// Status sequence reported per server after attachment; the last entry sticks.
    pub attach_progress: HashMap<String, VecDeque<AttachmentStatus>>,
    pub next_vswitch_id: u64,
    pub calls: Vec<String>,
}

/// Inventory that records every mutating call.
#[derive(Debug, Default)]
pub struct FakeInventory {
    state: Mutex<FakeState>,
}

impl FakeInventory {
    /// Inventory with servers `1..=n` at `10.0.0.<i>`.
    pub fn with_servers(n: usize) -> Self {
        let servers = (1..=n)
            .map(|i| Server {
                id: i.to_string(),
                name: format!("node-{i}"),
                ip: format!("10.0.0.{i}"),
                product: "AX52".to_string(),
                dc: "FSN1-DC14".to_string(),
                status: "ready".to_string(),
                cancelled: false,
                paid_until: None,
            })
            .collect();
        Self {
            state: Mutex::new(FakeState {
                servers,
                next_vswitch_id: 1000,
                ..FakeState::default()
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Calls starting with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn add_vswitch(&self, id: &str, name: &str, vlan: u16, cloud: bool) {
        self.state().vswitches.push(VSwitchDetails {
            vswitch: VSwitch {
                id: id.to_string(),
                name: name.to_string(),
                vlan,
                cancelled: false,
            },
            servers: Vec::new(),
            has_cloud_network: cloud,
        });
    }

    pub fn targets(&self) -> Vec<Target> {
        self.state().servers.iter().map(Target::from).collect()
    }
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn list_servers(&self) -> Result<Vec<Server>, ProviderError> {
        Ok(self.state().servers.clone())
    }

    async fn get_server(&self, id: &str) -> Result<ServerDetails, ProviderError> {
        let state = self.state();
        let server = state
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        Ok(ServerDetails {
            server,
            rescue_available: !state.no_rescue.contains(id),
            reset_available: true,
        })
    }

    async fn list_vswitches(&self) -> Result<Vec<VSwitch>, ProviderError> {
        Ok(self
            .state()
            .vswitches
            .iter()
            .map(|d| d.vswitch.clone())
            .collect())
    }

    async fn get_vswitch(&self, id: &str) -> Result<VSwitchDetails, ProviderError> {
        let mut state = self.state();
        let FakeState {
            vswitches,
            attach_progress,
            ..
        } = &mut *state;
        let details = vswitches
            .iter_mut()
            .find(|d| d.vswitch.id == id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        for server in &mut details.servers {
            if let Some(queue) = attach_progress.get_mut(&server.server_id) {
                if let Some(next) = queue.pop_front() {
                    server.status = next;
                }
            }
        }
        Ok(details.clone())
    }

    async fn create_vswitch(&self, name: &str, vlan: u16) -> Result<VSwitch, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("create_vswitch:{name}:{vlan}"));
        state.next_vswitch_id += 1;
        let vswitch = VSwitch {
            id: state.next_vswitch_id.to_string(),
            name: name.to_string(),
            vlan,
            cancelled: false,
        };
        state.vswitches.push(VSwitchDetails {
            vswitch: vswitch.clone(),
            servers: Vec::new(),
            has_cloud_network: false,
        });
        Ok(vswitch)
    }

    async fn delete_vswitch(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("delete_vswitch:{id}"));
        if let Some(details) = state.vswitches.iter_mut().find(|d| d.vswitch.id == id) {
            details.vswitch.cancelled = true;
        }
        Ok(())
    }

    async fn attach_servers(
        &self,
        vswitch_id: &str,
        server_ids: &[String],
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("attach:{vswitch_id}:{}", server_ids.join(",")));
        let ips: HashMap<String, String> = state
            .servers
            .iter()
            .map(|s| (s.id.clone(), s.ip.clone()))
            .collect();
        let details = state
            .vswitches
            .iter_mut()
            .find(|d| d.vswitch.id == vswitch_id)
            .ok_or_else(|| ProviderError::NotFound(vswitch_id.to_string()))?;
        for id in server_ids {
            match details.servers.iter_mut().find(|s| &s.server_id == id) {
                Some(existing) => existing.status = AttachmentStatus::InProcess,
                None => details.servers.push(AttachedServer {
                    server_id: id.clone(),
                    server_ip: ips.get(id).cloned().unwrap_or_default(),
                    status: AttachmentStatus::InProcess,
                }),
            }
        }
        Ok(())
    }

    async fn rescue_status(&self, id: &str) -> Result<RescueState, ProviderError> {
        let state = self.state();
        Ok(RescueState {
            server_id: id.to_string(),
            active: state.rescue_active.get(id).copied().unwrap_or(false),
            password: state.rescue_passwords.get(id).cloned().flatten(),
        })
    }

    async fn enable_rescue(&self, id: &str) -> Result<RescueState, ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("enable_rescue:{id}"));
        let password = match state.activation_passwords.get(id) {
            Some(p) => p.clone().filter(|p| !p.is_empty()),
            None => Some(format!("pw-{id}")),
        };
        state.rescue_active.insert(id.to_string(), true);
        state
            .rescue_passwords
            .insert(id.to_string(), password.clone());
        Ok(RescueState {
            server_id: id.to_string(),
            active: true,
            password,
        })
    }

    async fn disable_rescue(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(format!("disable_rescue:{id}"));
        if !state.stuck_active.contains(id) {
            state.rescue_active.insert(id.to_string(), false);
            state.rescue_passwords.remove(id);
        }
        Ok(())
    }

    async fn reset_server(&self, id: &str) -> Result<(), ProviderError> {
        self.state().calls.push(format!("reset:{id}"));
        Ok(())
    }
}

/// Probe that replays a per-target script, then a default outcome.
#[derive(Debug)]
pub struct ScriptedProbe {
    default: ProbeOutcome,
    scripts: Mutex<HashMap<String, VecDeque<ProbeOutcome>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedProbe {
    pub fn reachable() -> Self {
        Self::with_default(ProbeOutcome::Reachable)
    }

    pub fn unreachable() -> Self {
        Self::with_default(ProbeOutcome::Unreachable("no reply".to_string()))
    }

    fn with_default(default: ProbeOutcome) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, id: &str, outcomes: Vec<ProbeOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), outcomes.into());
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn check(&self, target: &Target) -> ProbeOutcome {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(target.id.clone())
            .or_default() += 1;
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&target.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }
}
