//! Mode-keyed description of the node graphs to build.
//!
//! A [`PipelineSpec`] maps an operating-mode name to a [`GraphSpec`]: the
//! nodes (by processor name), which stream intent each sink produces for,
//! and the port wiring. It is an in-memory table; loading it from files is
//! left to the host.
//!
//! # Example
//!
//! ```rust
//! use campipe::pipeline::{GraphSpec, NodeSpec, PipelineSpec};
//! use campipe::stream::StreamIntent;
//!
//! let preview = GraphSpec::new()
//!     .node(NodeSpec::source("sensor", "passthrough"))
//!     .node(NodeSpec::process("isp", "passthrough"))
//!     .node(NodeSpec::sink("preview_out", "passthrough", StreamIntent::Preview))
//!     .link("sensor", "isp")
//!     .link("isp", "preview_out");
//!
//! let spec = PipelineSpec::new().with_mode("preview", preview);
//! assert!(spec.mode("preview").is_some());
//! ```

use super::NodeKind;
use crate::stream::StreamIntent;
use std::collections::{BTreeMap, HashMap};

/// Default output port name.
pub const DEFAULT_OUTPUT: &str = "out";
/// Default input port name.
pub const DEFAULT_INPUT: &str = "in";

/// One node of a graph description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Unique node name within the graph.
    pub name: String,
    /// Processor name looked up in the `NodeFactory`.
    pub processor: String,
    /// Role in the graph.
    pub kind: NodeKind,
    /// Stream intent a sink produces results for.
    pub intent: Option<StreamIntent>,
    /// Input port names.
    pub inputs: Vec<String>,
    /// Output port names.
    pub outputs: Vec<String>,
    /// Free-form processor properties.
    pub properties: BTreeMap<String, String>,
}

impl NodeSpec {
    fn with_kind(name: &str, processor: &str, kind: NodeKind) -> Self {
        let (inputs, outputs) = match kind {
            NodeKind::Source => (vec![], vec![DEFAULT_OUTPUT.to_string()]),
            NodeKind::Process => (
                vec![DEFAULT_INPUT.to_string()],
                vec![DEFAULT_OUTPUT.to_string()],
            ),
            NodeKind::Sink => (vec![DEFAULT_INPUT.to_string()], vec![]),
        };
        Self {
            name: name.to_string(),
            processor: processor.to_string(),
            kind,
            intent: None,
            inputs,
            outputs,
            properties: BTreeMap::new(),
        }
    }

    /// Zero-input node where buffers enter.
    pub fn source(name: &str, processor: &str) -> Self {
        Self::with_kind(name, processor, NodeKind::Source)
    }

    /// Intermediate node with one input and one output.
    pub fn process(name: &str, processor: &str) -> Self {
        Self::with_kind(name, processor, NodeKind::Process)
    }

    /// Zero-output node emitting results for `intent`.
    pub fn sink(name: &str, processor: &str, intent: StreamIntent) -> Self {
        let mut spec = Self::with_kind(name, processor, NodeKind::Sink);
        spec.intent = Some(intent);
        spec
    }

    /// Replace the output ports.
    pub fn outputs(mut self, ports: &[&str]) -> Self {
        self.outputs = ports.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Replace the input ports.
    pub fn inputs(mut self, ports: &[&str]) -> Self {
        self.inputs = ports.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set a processor property.
    pub fn property(mut self, key: &str, value: impl ToString) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

/// A connection from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    /// Upstream node.
    pub from: String,
    /// Upstream output port.
    pub from_port: String,
    /// Downstream node.
    pub to: String,
    /// Downstream input port.
    pub to_port: String,
}

/// Nodes and links of one mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSpec {
    /// Nodes in declaration order.
    pub nodes: Vec<NodeSpec>,
    /// Links in declaration order.
    pub links: Vec<LinkSpec>,
}

impl GraphSpec {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node.
    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Link default ports: `from.out` to `to.in`.
    pub fn link(self, from: &str, to: &str) -> Self {
        self.link_ports(from, DEFAULT_OUTPUT, to, DEFAULT_INPUT)
    }

    /// Link named ports.
    pub fn link_ports(mut self, from: &str, from_port: &str, to: &str, to_port: &str) -> Self {
        self.links.push(LinkSpec {
            from: from.to_string(),
            from_port: from_port.to_string(),
            to: to.to_string(),
            to_port: to_port.to_string(),
        });
        self
    }

    /// One independent `source -> sink` chain per intent, both pass-through.
    ///
    /// Node names are `<intent>_src` and `<intent>_sink`.
    pub fn direct(intents: &[StreamIntent]) -> Self {
        intents.iter().fold(Self::new(), |graph, intent| {
            let src = format!("{}_src", intent.as_str());
            let sink = format!("{}_sink", intent.as_str());
            graph
                .node(NodeSpec::source(&src, "passthrough"))
                .node(NodeSpec::sink(&sink, "passthrough", *intent))
                .link(&src, &sink)
        })
    }
}

/// Graph descriptions keyed by mode name.
#[derive(Debug, Clone, Default)]
pub struct PipelineSpec {
    modes: HashMap<String, GraphSpec>,
}

impl PipelineSpec {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a mode.
    pub fn with_mode(mut self, mode: &str, graph: GraphSpec) -> Self {
        self.modes.insert(mode.to_string(), graph);
        self
    }

    /// Graph for `mode`.
    pub fn mode(&self, mode: &str) -> Option<&GraphSpec> {
        self.modes.get(mode)
    }

    /// Known mode names, sorted.
    pub fn modes(&self) -> Vec<&str> {
        let mut modes: Vec<_> = self.modes.keys().map(String::as_str).collect();
        modes.sort_unstable();
        modes
    }
}
