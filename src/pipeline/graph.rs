//! Pipeline graph structure using daggy.

use super::factory::NodeFactory;
use super::node::{NodeKind, NodeProcessor};
use super::spec::GraphSpec;
use crate::buffer::StreamId;
use crate::error::{Error, Result};
use crate::stream::StreamIntent;
use crate::sync::lock;
use daggy::petgraph::Direction;
use daggy::{Dag, NodeIndex, Walker};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Unique identifier for a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) NodeIndex);

impl NodeId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// The port on the other end of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPeer {
    /// Peer node.
    pub node: NodeId,
    /// Peer port name.
    pub port: String,
}

/// A named connection point with at most one peer.
#[derive(Debug, Clone)]
pub struct Port {
    name: String,
    peer: Option<PortPeer>,
}

impl Port {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            peer: None,
        }
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connected peer, if linked.
    pub fn peer(&self) -> Option<&PortPeer> {
        self.peer.as_ref()
    }
}

/// A node in the pipeline graph.
pub struct Node {
    name: String,
    kind: NodeKind,
    stream: Option<StreamId>,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    processor: Mutex<Box<dyn NodeProcessor>>,
}

impl Node {
    /// Create a node with the given ports.
    pub fn new(
        name: impl Into<String>,
        kind: NodeKind,
        inputs: &[&str],
        outputs: &[&str],
        processor: Box<dyn NodeProcessor>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            stream: None,
            inputs: inputs.iter().map(|p| Port::new(p)).collect(),
            outputs: outputs.iter().map(|p| Port::new(p)).collect(),
            processor: Mutex::new(processor),
        }
    }

    /// Get the node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role in the graph.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Stream a sink emits results for.
    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    /// Input ports.
    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    /// Output ports.
    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    /// Lock the processor for a lifecycle call.
    pub fn processor(&self) -> MutexGuard<'_, Box<dyn NodeProcessor>> {
        lock(&self.processor)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("stream", &self.stream)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// A link between two nodes in the graph.
#[derive(Debug, Clone)]
pub struct Link {
    /// Name of the upstream output port.
    pub src_port: String,
    /// Name of the downstream input port.
    pub sink_port: String,
}

/// The node graph of one operating mode.
pub struct PipelineGraph {
    mode: String,
    graph: Dag<Node, Link>,
    nodes_by_name: HashMap<String, NodeId>,
}

impl PipelineGraph {
    /// Create an empty graph.
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            graph: Dag::new(),
            nodes_by_name: HashMap::new(),
        }
    }

    /// Build a graph from its description.
    ///
    /// Sinks are bound to the stream registered for their intent in
    /// `streams`; a sink whose intent has no stream stays unbound and is
    /// ignored by the dispatcher.
    pub fn build(
        mode: &str,
        spec: &GraphSpec,
        factory: &NodeFactory,
        streams: &HashMap<StreamIntent, StreamId>,
    ) -> Result<Self> {
        let mut graph = Self::new(mode);

        for node_spec in &spec.nodes {
            if node_spec.kind == NodeKind::Sink && node_spec.intent.is_none() {
                return Err(Error::pipeline(format!(
                    "sink '{}' has no stream intent",
                    node_spec.name
                )));
            }
            let processor = factory.create(node_spec)?;
            let inputs: Vec<&str> = node_spec.inputs.iter().map(String::as_str).collect();
            let outputs: Vec<&str> = node_spec.outputs.iter().map(String::as_str).collect();
            let id = graph.add_node(Node::new(
                node_spec.name.clone(),
                node_spec.kind,
                &inputs,
                &outputs,
                processor,
            ))?;
            if let Some(stream) = node_spec.intent.and_then(|i| streams.get(&i)) {
                graph.bind_stream(id, *stream)?;
            }
        }

        for link in &spec.links {
            let from = graph.node_id(&link.from).ok_or_else(|| {
                Error::pipeline(format!("link from unknown node '{}'", link.from))
            })?;
            let to = graph
                .node_id(&link.to)
                .ok_or_else(|| Error::pipeline(format!("link to unknown node '{}'", link.to)))?;
            graph.link_ports(from, &link.from_port, to, &link.to_port)?;
        }

        graph.validate()?;
        tracing::debug!(
            mode,
            nodes = graph.node_count(),
            links = graph.edge_count(),
            "pipeline graph built"
        );
        Ok(graph)
    }

    /// Mode this graph was built for.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Add a node. Names must be unique.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        if self.nodes_by_name.contains_key(node.name()) {
            return Err(Error::pipeline(format!("duplicate node '{}'", node.name())));
        }
        let name = node.name.clone();
        let id = NodeId(self.graph.add_node(node));
        self.nodes_by_name.insert(name, id);
        Ok(id)
    }

    /// Bind a sink to the stream it emits results for.
    pub fn bind_stream(&mut self, id: NodeId, stream: StreamId) -> Result<()> {
        let node = self
            .graph
            .node_weight_mut(id.0)
            .ok_or_else(|| Error::pipeline("node not found"))?;
        if node.kind != NodeKind::Sink {
            return Err(Error::pipeline(format!(
                "only sinks bind to a stream, '{}' is {:?}",
                node.name, node.kind
            )));
        }
        node.stream = Some(stream);
        Ok(())
    }

    /// Get a node by ID.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id.0)
    }

    /// Get a node ID by name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes_by_name.get(name).copied()
    }

    /// Link `src.src_port` to `sink.sink_port`.
    ///
    /// Both ports must exist and be unconnected; the link must not close a
    /// cycle.
    pub fn link_ports(
        &mut self,
        src: NodeId,
        src_port: &str,
        sink: NodeId,
        sink_port: &str,
    ) -> Result<()> {
        let src_name = self.port_check(src, src_port, Direction::Outgoing)?;
        let sink_name = self.port_check(sink, sink_port, Direction::Incoming)?;

        self.graph
            .add_edge(
                src.0,
                sink.0,
                Link {
                    src_port: src_port.to_string(),
                    sink_port: sink_port.to_string(),
                },
            )
            .map_err(|_| {
                Error::pipeline(format!(
                    "linking '{}' to '{}' would create a cycle",
                    src_name, sink_name
                ))
            })?;

        if let Some(node) = self.graph.node_weight_mut(src.0) {
            if let Some(port) = node.outputs.iter_mut().find(|p| p.name == src_port) {
                port.peer = Some(PortPeer {
                    node: sink,
                    port: sink_port.to_string(),
                });
            }
        }
        if let Some(node) = self.graph.node_weight_mut(sink.0) {
            if let Some(port) = node.inputs.iter_mut().find(|p| p.name == sink_port) {
                port.peer = Some(PortPeer {
                    node: src,
                    port: src_port.to_string(),
                });
            }
        }
        Ok(())
    }

    fn port_check(&self, id: NodeId, port: &str, direction: Direction) -> Result<String> {
        let node = self
            .node(id)
            .ok_or_else(|| Error::pipeline("node not found"))?;
        let ports = match direction {
            Direction::Outgoing => &node.outputs,
            Direction::Incoming => &node.inputs,
        };
        let found = ports.iter().find(|p| p.name == port).ok_or_else(|| {
            Error::pipeline(format!("node '{}' has no port '{}'", node.name, port))
        })?;
        if found.peer.is_some() {
            return Err(Error::pipeline(format!(
                "port '{}.{}' is already linked",
                node.name, port
            )));
        }
        Ok(node.name.clone())
    }

    /// Nodes with no incoming links.
    pub fn sources(&self) -> Vec<NodeId> {
        self.boundary(Direction::Incoming)
    }

    /// Nodes with no outgoing links.
    pub fn sinks(&self) -> Vec<NodeId> {
        self.boundary(Direction::Outgoing)
    }

    fn boundary(&self, direction: Direction) -> Vec<NodeId> {
        self.graph
            .graph()
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .graph()
                    .neighbors_directed(idx, direction)
                    .next()
                    .is_none()
            })
            .map(NodeId)
            .collect()
    }

    /// Upstream nodes of `id`.
    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.graph
            .parents(id.0)
            .iter(&self.graph)
            .map(|(_, idx)| NodeId(idx))
            .collect()
    }

    /// Every node that reaches `sink`, plus `sink`, ordered source-first.
    ///
    /// Branches that never reach `sink` are left out.
    pub fn sequence_to(&self, sink: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.visit_upstream(sink, &mut visited, &mut order);
        order
    }

    // Post-order over parents yields every ancestor before its descendants
    fn visit_upstream(&self, id: NodeId, visited: &mut HashSet<NodeId>, order: &mut Vec<NodeId>) {
        if !visited.insert(id) {
            return;
        }
        let mut parents = self.parents(id);
        parents.sort_by_key(NodeId::index);
        for parent in parents {
            self.visit_upstream(parent, visited, order);
        }
        order.push(id);
    }

    /// Get the number of nodes.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of links.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Validate the graph structure.
    ///
    /// Checks that every zero-input node is a `Source`, every zero-output
    /// node is a `Sink`, and that no declared port was left dangling.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::pipeline("graph is empty"));
        }

        for id in self.sources() {
            let node = self.checked(id)?;
            if node.kind != NodeKind::Source {
                return Err(Error::pipeline(format!(
                    "node '{}' has no inputs but is not a source",
                    node.name
                )));
            }
        }
        for id in self.sinks() {
            let node = self.checked(id)?;
            if node.kind != NodeKind::Sink {
                return Err(Error::pipeline(format!(
                    "node '{}' has no outputs but is not a sink",
                    node.name
                )));
            }
        }
        for node in self
            .graph
            .graph()
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx))
        {
            if let Some(port) = node
                .inputs
                .iter()
                .chain(node.outputs.iter())
                .find(|p| p.peer.is_none())
            {
                return Err(Error::pipeline(format!(
                    "port '{}.{}' is not linked",
                    node.name, port.name
                )));
            }
        }
        Ok(())
    }

    fn checked(&self, id: NodeId) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| Error::pipeline("node not found"))
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("mode", &self.mode)
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::node::PassThrough;
    use crate::pipeline::spec::NodeSpec;

    fn node(name: &str, kind: NodeKind) -> Node {
        let (inputs, outputs): (&[&str], &[&str]) = match kind {
            NodeKind::Source => (&[], &["out"]),
            NodeKind::Process => (&["in"], &["out"]),
            NodeKind::Sink => (&["in"], &[]),
        };
        Node::new(name, kind, inputs, outputs, Box::new(PassThrough::new()))
    }

    fn names(graph: &PipelineGraph, ids: &[NodeId]) -> Vec<String> {
        ids.iter()
            .map(|id| graph.node(*id).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_linear_sequence() {
        let mut graph = PipelineGraph::new("test");
        let a = graph.add_node(node("a", NodeKind::Source)).unwrap();
        let b = graph.add_node(node("b", NodeKind::Process)).unwrap();
        let sink = graph.add_node(node("sink", NodeKind::Sink)).unwrap();
        graph.link_ports(a, "out", b, "in").unwrap();
        graph.link_ports(b, "out", sink, "in").unwrap();

        graph.validate().unwrap();
        assert_eq!(graph.sources(), vec![a]);
        assert_eq!(graph.sinks(), vec![sink]);
        assert_eq!(names(&graph, &graph.sequence_to(sink)), vec!["a", "b", "sink"]);
    }

    #[test]
    fn test_port_has_one_peer() {
        let mut graph = PipelineGraph::new("test");
        let a = graph.add_node(node("a", NodeKind::Source)).unwrap();
        let s1 = graph.add_node(node("s1", NodeKind::Sink)).unwrap();
        let s2 = graph.add_node(node("s2", NodeKind::Sink)).unwrap();
        graph.link_ports(a, "out", s1, "in").unwrap();
        assert!(graph.link_ports(a, "out", s2, "in").is_err());
        assert!(graph.link_ports(a, "missing", s2, "in").is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = PipelineGraph::new("test");
        let multi = |name: &str| {
            Node::new(
                name,
                NodeKind::Process,
                &["in", "back"],
                &["out", "loop"],
                Box::new(PassThrough::new()),
            )
        };
        let a = graph.add_node(multi("a")).unwrap();
        let b = graph.add_node(multi("b")).unwrap();
        graph.link_ports(a, "out", b, "in").unwrap();
        assert!(graph.link_ports(b, "loop", a, "back").is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut graph = PipelineGraph::new("test");
        graph.add_node(node("a", NodeKind::Source)).unwrap();
        assert!(graph.add_node(node("a", NodeKind::Sink)).is_err());
    }

    #[test]
    fn test_branch_pruned_from_sequence() {
        let spec = GraphSpec::new()
            .node(NodeSpec::source("sensor", "passthrough").outputs(&["p", "s"]))
            .node(NodeSpec::process("scaler", "passthrough"))
            .node(NodeSpec::sink("preview", "passthrough", StreamIntent::Preview))
            .node(NodeSpec::process("jpeg", "passthrough"))
            .node(NodeSpec::sink("still", "passthrough", StreamIntent::Still))
            .link_ports("sensor", "p", "scaler", "in")
            .link("scaler", "preview")
            .link_ports("sensor", "s", "jpeg", "in")
            .link("jpeg", "still");

        let streams = HashMap::from([(StreamIntent::Preview, StreamId(0))]);
        let graph = PipelineGraph::build("mixed", &spec, &NodeFactory::new(), &streams).unwrap();

        let preview = graph.node_id("preview").unwrap();
        let still = graph.node_id("still").unwrap();
        assert_eq!(graph.node(preview).unwrap().stream(), Some(StreamId(0)));
        assert_eq!(graph.node(still).unwrap().stream(), None);
        assert_eq!(
            names(&graph, &graph.sequence_to(preview)),
            vec!["sensor", "scaler", "preview"]
        );
        assert_eq!(
            names(&graph, &graph.sequence_to(still)),
            vec!["sensor", "jpeg", "still"]
        );
    }

    #[test]
    fn test_dangling_port_fails_validation() {
        let spec = GraphSpec::new()
            .node(NodeSpec::source("sensor", "passthrough").outputs(&["a", "b"]))
            .node(NodeSpec::sink("out", "passthrough", StreamIntent::Preview))
            .link_ports("sensor", "a", "out", "in");
        let result = PipelineGraph::build("bad", &spec, &NodeFactory::new(), &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_link_target_fails() {
        let spec = GraphSpec::new()
            .node(NodeSpec::source("sensor", "passthrough"))
            .link("sensor", "nowhere");
        let result = PipelineGraph::build("bad", &spec, &NodeFactory::new(), &HashMap::new());
        assert!(result.is_err());
    }
}
