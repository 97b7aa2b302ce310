//! Agent registry: name → `AgentSpec` lookup. Loading specs from files is
//! out of scope (§1 "reading of policy/agent YAML files"); callers
//! construct the registry from already-parsed specs.

use std::collections::HashMap;

use crate::agent_spec::AgentSpec;

#[derive(Default)]
pub struct AgentRegistry {
    specs: HashMap<String, AgentSpec>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: AgentSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn resolve(&self, name: &str) -> Option<&AgentSpec> {
        self.specs.get(name)
    }
}
