//! Agent registry.
//!
//! Tracks every registered agent's definition and lifecycle state. The map
//! itself is behind an `RwLock` that is only held long enough to insert,
//! remove or find an entry; each entry has its own mutex, so writers for
//! different agents never contend.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::check::{DependencyGraph, check_cycles};
use crate::definition::{AgentDefinition, TriggerType};
use crate::error::{OrchestratorError, Result};
use crate::store::{DefinitionStore, MemoryStore};

/// Operational status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Registered,
    Starting,
    Running,
    Degraded,
    Stopped,
    Failed,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Registered => write!(f, "registered"),
            Lifecycle::Starting => write!(f, "starting"),
            Lifecycle::Running => write!(f, "running"),
            Lifecycle::Degraded => write!(f, "degraded"),
            Lifecycle::Stopped => write!(f, "stopped"),
            Lifecycle::Failed => write!(f, "failed"),
        }
    }
}

impl Lifecycle {
    /// Whether the scheduler refuses new work for an agent in this state.
    pub fn rejects_work(&self) -> bool {
        matches!(self, Lifecycle::Stopped | Lifecycle::Failed)
    }

    /// Whether the health monitor probes agents in this state.
    pub fn is_probed(&self) -> bool {
        matches!(
            self,
            Lifecycle::Registered | Lifecycle::Starting | Lifecycle::Running | Lifecycle::Degraded
        )
    }
}

/// Mutable companion to an [`AgentDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub lifecycle: Lifecycle,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl AgentState {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Registered,
            consecutive_failures: 0,
            last_health_check: None,
            registered_at: Utc::now(),
        }
    }
}

/// Serialized registry contents: definitions only, state is not carried.
///
/// Written as `{"agents": [...]}`. On read, `agents` may also be a map from
/// agent name to definition; other top-level keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegistrySnapshot {
    #[serde(deserialize_with = "agents_list_or_map")]
    pub agents: Vec<AgentDefinition>,
}

fn agents_list_or_map<'de, D>(deserializer: D) -> std::result::Result<Vec<AgentDefinition>, D::Error>
where
    D: Deserializer<'de>,
{
    struct AgentsVisitor;

    impl<'de> Visitor<'de> for AgentsVisitor {
        type Value = Vec<AgentDefinition>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a list of agent definitions or a map of name to definition")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
            let mut agents = Vec::new();
            while let Some(def) = seq.next_element()? {
                agents.push(def);
            }
            Ok(agents)
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut agents = Vec::new();
            while let Some((name, mut def)) = map.next_entry::<String, AgentDefinition>()? {
                if def.name.is_empty() {
                    def.name = name;
                } else if def.name != name {
                    return Err(de::Error::custom(format!(
                        "agent listed as '{}' is named '{}'",
                        name, def.name
                    )));
                }
                if def.description.is_empty() {
                    def.description = format!("Microagent {}", def.name);
                }
                agents.push(def);
            }
            Ok(agents)
        }
    }

    deserializer.deserialize_any(AgentsVisitor)
}

struct Entry {
    seq: u64,
    definition: AgentDefinition,
    state: AgentState,
}

type EntryRef = Arc<Mutex<Entry>>;

fn lock(entry: &EntryRef) -> MutexGuard<'_, Entry> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, EntryRef>>,
    next_seq: AtomicU64,
    store: Arc<dyn DefinitionStore>,
}

impl AgentRegistry {
    /// Create an empty registry persisting into `store`.
    pub fn new(store: Arc<dyn DefinitionStore>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            store,
        }
    }

    /// Create an empty registry without durable storage.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Create a registry populated from the definitions already in `store`.
    /// Definitions that fail validation are logged and skipped.
    pub fn open(store: Arc<dyn DefinitionStore>) -> Result<Self> {
        let defs = store.load_all()?;
        let registry = Self::new(store);
        for def in defs {
            let name = def.name.clone();
            let mut agents = registry.write_map();
            if let Err(e) = registry.check_insertable(&agents, &def) {
                warn!("Skipping stored agent '{}': {}", name, e);
                continue;
            }
            registry.insert_locked(&mut agents, def);
        }
        Ok(registry)
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, EntryRef>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, EntryRef>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, name: &str) -> Result<EntryRef> {
        self.read_map()
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent '{}'", name)))
    }

    /// Entries in registration order.
    fn ordered_entries(&self) -> Vec<EntryRef> {
        let entries: Vec<EntryRef> = self.read_map().values().cloned().collect();
        let mut keyed: Vec<(u64, EntryRef)> = entries
            .into_iter()
            .map(|e| {
                let seq = lock(&e).seq;
                (seq, e)
            })
            .collect();
        keyed.sort_by_key(|(seq, _)| *seq);
        keyed.into_iter().map(|(_, e)| e).collect()
    }

    fn check_insertable(
        &self,
        agents: &HashMap<String, EntryRef>,
        def: &AgentDefinition,
    ) -> Result<()> {
        def.validate()?;
        if agents.contains_key(&def.name) {
            return Err(OrchestratorError::DuplicateAgent(def.name.clone()));
        }
        let mut others: Vec<AgentDefinition> =
            agents.values().map(|e| lock(e).definition.clone()).collect();
        others.push(def.clone());
        check_dependency_cycles(&others, &def.name)
    }

    fn insert_locked(&self, agents: &mut HashMap<String, EntryRef>, def: AgentDefinition) -> AgentState {
        let state = AgentState::new();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        agents.insert(
            def.name.clone(),
            Arc::new(Mutex::new(Entry {
                seq,
                definition: def,
                state: state.clone(),
            })),
        );
        state
    }

    /// Register a new agent. Fails if the name is taken or the definition
    /// is malformed; the registry is unchanged on failure.
    pub fn register(&self, def: AgentDefinition) -> Result<AgentState> {
        let mut agents = self.write_map();
        self.check_insertable(&agents, &def)?;
        self.store.save(&def)?;
        let name = def.name.clone();
        let state = self.insert_locked(&mut agents, def);
        info!("Registered agent: {}", name);
        Ok(state)
    }

    /// Replace an agent's definition, keeping its lifecycle state.
    pub fn update(&self, name: &str, def: AgentDefinition) -> Result<AgentState> {
        def.validate()?;
        if def.name != name {
            return Err(OrchestratorError::Validation(format!(
                "cannot rename agent '{}' to '{}' through update",
                name, def.name
            )));
        }

        let agents = self.write_map();
        let entry = agents
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent '{}'", name)))?;

        let mut all: Vec<AgentDefinition> = agents
            .iter()
            .filter(|(n, _)| n.as_str() != name)
            .map(|(_, e)| lock(e).definition.clone())
            .collect();
        all.push(def.clone());
        check_dependency_cycles(&all, name)?;

        self.store.save(&def)?;
        let mut guard = lock(&entry);
        guard.definition = def;
        info!("Updated agent: {}", name);
        Ok(guard.state.clone())
    }

    /// Remove an agent unconditionally. Busy checks live in the scheduler,
    /// which owns the task queues.
    pub(crate) fn remove(&self, name: &str) -> Result<AgentDefinition> {
        let mut agents = self.write_map();
        if !agents.contains_key(name) {
            return Err(OrchestratorError::NotFound(format!("agent '{}'", name)));
        }
        self.store.remove(name)?;
        let entry = agents
            .remove(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent '{}'", name)))?;
        let def = lock(&entry).definition.clone();
        info!("Deregistered agent: {}", name);
        Ok(def)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read_map().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<(AgentDefinition, AgentState)> {
        let entry = self.entry(name)?;
        let guard = lock(&entry);
        Ok((guard.definition.clone(), guard.state.clone()))
    }

    pub fn state(&self, name: &str) -> Result<AgentState> {
        let entry = self.entry(name)?;
        let state = lock(&entry).state.clone();
        Ok(state)
    }

    /// All agents in registration order, optionally filtered by trigger.
    pub fn list(&self, trigger: Option<TriggerType>) -> Vec<(AgentDefinition, AgentState)> {
        self.ordered_entries()
            .iter()
            .map(|e| {
                let guard = lock(e);
                (guard.definition.clone(), guard.state.clone())
            })
            .filter(|(def, _)| trigger.is_none_or(|t| def.trigger_type == t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Agents declaring `capability`, in registration order. Failed agents
    /// are left out until they are reset.
    pub fn lookup_by_capability(&self, capability: &str) -> Vec<AgentDefinition> {
        self.ordered_entries()
            .iter()
            .filter_map(|e| {
                let guard = lock(e);
                (guard.definition.has_capability(capability)
                    && guard.state.lifecycle != Lifecycle::Failed)
                    .then(|| guard.definition.clone())
            })
            .collect()
    }

    fn modify<T>(&self, name: &str, f: impl FnOnce(&mut AgentState) -> Result<T>) -> Result<T> {
        let entry = self.entry(name)?;
        let mut guard = lock(&entry);
        f(&mut guard.state)
    }

    /// Put back state persisted by an earlier process. `saved` is in
    /// registration order and also restores that order; agents missing
    /// from it follow, in their current order. Returns the names in
    /// `saved` with no stored definition.
    pub(crate) fn restore(&self, saved: Vec<(String, AgentState)>) -> Vec<String> {
        let entries = self.ordered_entries();
        let agents = self.read_map();
        let mut seq = 0;
        let mut restored = HashSet::new();
        let mut unknown = Vec::new();
        for (name, state) in saved {
            let Some(entry) = agents.get(&name) else {
                unknown.push(name);
                continue;
            };
            if !restored.insert(name) {
                continue;
            }
            let mut guard = lock(entry);
            guard.state = state;
            guard.seq = seq;
            seq += 1;
        }
        for entry in &entries {
            let mut guard = lock(entry);
            if !restored.contains(&guard.definition.name) {
                guard.seq = seq;
                seq += 1;
            }
        }
        self.next_seq.store(seq, Ordering::SeqCst);
        unknown
    }

    /// Apply a health probe result and return the new lifecycle.
    ///
    /// A success lands on Running with the failure count cleared. A
    /// failure lands on Degraded, and only an agent that is already
    /// Degraded moves on to Failed once `threshold` consecutive failures
    /// have accumulated. Results for Stopped and Failed agents are refused
    /// with `AgentUnavailable` and change nothing; those agents only leave
    /// their state through `start` or `reset`.
    pub fn record_probe(&self, name: &str, healthy: bool, threshold: u32) -> Result<Lifecycle> {
        self.modify(name, |state| {
            let before = state.lifecycle;
            if !before.is_probed() {
                return Err(OrchestratorError::AgentUnavailable {
                    agent: name.to_string(),
                    lifecycle: before,
                });
            }
            state.last_health_check = Some(Utc::now());
            if healthy {
                state.consecutive_failures = 0;
                state.lifecycle = Lifecycle::Running;
            } else {
                state.consecutive_failures += 1;
                state.lifecycle = match before {
                    Lifecycle::Degraded if state.consecutive_failures >= threshold => {
                        Lifecycle::Failed
                    }
                    _ => Lifecycle::Degraded,
                };
            }
            if before != state.lifecycle {
                info!("Agent '{}' {} -> {}", name, before, state.lifecycle);
            }
            Ok(state.lifecycle)
        })
    }

    /// Side channel from the scheduler: a failed invocation counts against
    /// the agent, a successful one does not reset the probe counter.
    pub fn record_task_outcome(&self, name: &str, succeeded: bool) {
        if succeeded {
            return;
        }
        let res = self.modify(name, |state| {
            state.consecutive_failures += 1;
            Ok(state.consecutive_failures)
        });
        match res {
            Ok(n) => debug!("Agent '{}' task failure recorded ({} consecutive)", name, n),
            Err(_) => debug!("Task outcome for deregistered agent '{}' dropped", name),
        }
    }

    /// Administrative reset of a Failed agent back to Registered.
    pub fn reset(&self, name: &str) -> Result<AgentState> {
        self.modify(name, |state| {
            if state.lifecycle != Lifecycle::Failed {
                return Err(OrchestratorError::Validation(format!(
                    "agent '{}' is {}, only failed agents can be reset",
                    name, state.lifecycle
                )));
            }
            state.lifecycle = Lifecycle::Registered;
            state.consecutive_failures = 0;
            info!("Agent '{}' reset to registered", name);
            Ok(state.clone())
        })
    }

    /// Take an agent out of service; it stops accepting tasks and is no
    /// longer probed.
    pub fn stop(&self, name: &str) -> Result<AgentState> {
        self.modify(name, |state| {
            state.lifecycle = Lifecycle::Stopped;
            info!("Agent '{}' stopped", name);
            Ok(state.clone())
        })
    }

    /// Bring a stopped agent back; the next successful probe marks it
    /// Running.
    pub fn start(&self, name: &str) -> Result<AgentState> {
        self.modify(name, |state| {
            match state.lifecycle {
                Lifecycle::Stopped | Lifecycle::Registered => {
                    state.lifecycle = Lifecycle::Starting;
                    state.consecutive_failures = 0;
                }
                Lifecycle::Failed => {
                    return Err(OrchestratorError::Validation(format!(
                        "agent '{}' has failed; reset it before starting",
                        name
                    )));
                }
                _ => {}
            }
            Ok(state.clone())
        })
    }

    pub fn export_snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            agents: self.list(None).into_iter().map(|(def, _)| def).collect(),
        }
    }

    /// Register every definition in `snapshot` with fresh state. Either all
    /// definitions are imported or none are: if the store fails partway,
    /// the definitions already written are removed again.
    pub fn import_snapshot(&self, snapshot: &RegistrySnapshot) -> Result<usize> {
        let mut agents = self.write_map();

        let mut combined: Vec<AgentDefinition> =
            agents.values().map(|e| lock(e).definition.clone()).collect();
        for def in &snapshot.agents {
            def.validate()?;
            if agents.contains_key(&def.name) || combined.iter().any(|d| d.name == def.name) {
                return Err(OrchestratorError::DuplicateAgent(def.name.clone()));
            }
            combined.push(def.clone());
        }
        for def in &snapshot.agents {
            check_dependency_cycles(&combined, &def.name)?;
        }

        let mut saved: Vec<&str> = Vec::new();
        for def in &snapshot.agents {
            if let Err(e) = self.store.save(def) {
                for name in saved {
                    if let Err(undo) = self.store.remove(name) {
                        warn!("Could not roll back stored agent '{}': {}", name, undo);
                    }
                }
                return Err(e);
            }
            saved.push(&def.name);
        }
        for def in &snapshot.agents {
            self.insert_locked(&mut agents, def.clone());
        }
        info!("Imported {} agent(s)", snapshot.agents.len());
        Ok(snapshot.agents.len())
    }
}

/// Reject definitions whose dependencies, resolved through names and
/// capabilities, lead back to `name`.
fn check_dependency_cycles(defs: &[AgentDefinition], name: &str) -> Result<()> {
    let graph: DependencyGraph = defs
        .iter()
        .map(|def| {
            let deps: Vec<String> = def
                .dependencies
                .iter()
                .flat_map(|tag| {
                    defs.iter()
                        .filter(move |other| other.name != def.name && other.provides(tag))
                        .map(|other| other.name.clone())
                })
                .collect();
            (def.name.clone(), deps)
        })
        .collect();

    match check_cycles(&graph)
        .into_iter()
        .find(|cycle| cycle.iter().any(|n| n == name))
    {
        Some(cycle) => Err(OrchestratorError::Validation(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        ))),
        None => Ok(()),
    }
}
