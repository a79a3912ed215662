//! Node factory for creating processors from graph descriptions.

use super::node::{GateHandle, NodeProcessor, PassThrough, StatusGate};
use super::spec::NodeSpec;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Constructor for one processor name.
pub type NodeConstructor =
    Arc<dyn Fn(&NodeSpec) -> Result<Box<dyn NodeProcessor>> + Send + Sync>;

/// Registry of processor constructors.
///
/// Constructed explicitly and passed to whoever builds graphs.
#[derive(Clone)]
pub struct NodeFactory {
    constructors: HashMap<String, NodeConstructor>,
}

impl NodeFactory {
    /// Create a factory with built-in processors registered.
    pub fn new() -> Self {
        let mut factory = Self {
            constructors: HashMap::new(),
        };

        factory.register("passthrough", |_| Ok(Box::new(PassThrough::new())));
        factory.register("statusgate", create_statusgate);

        factory
    }

    /// Register (or replace) a processor constructor.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&NodeSpec) -> Result<Box<dyn NodeProcessor>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    /// Create the processor a node description names.
    pub fn create(&self, spec: &NodeSpec) -> Result<Box<dyn NodeProcessor>> {
        let constructor = self.constructors.get(&spec.processor).ok_or_else(|| {
            Error::pipeline(format!(
                "unknown processor '{}' for node '{}'",
                spec.processor, spec.name
            ))
        })?;
        constructor(spec)
    }

    /// Check if a processor name is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// List all registered processor names.
    pub fn list_processors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for NodeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeFactory")
            .field("processors", &self.list_processors())
            .finish()
    }
}

fn create_statusgate(spec: &NodeSpec) -> Result<Box<dyn NodeProcessor>> {
    let mut gate = StatusGate::new(GateHandle::new());
    if let Some(value) = spec.properties.get("drop_every") {
        let n = value.parse::<u64>().map_err(|_| {
            Error::InvalidConfig(format!(
                "node '{}': drop_every must be an integer, got '{}'",
                spec.name, value
            ))
        })?;
        gate = gate.drop_every(n);
    }
    Ok(Box::new(gate))
}
