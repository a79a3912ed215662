//! Processing graphs and their per-stream dispatch.
//!
//! This module provides the pipeline infrastructure:
//!
//! - [`PipelineSpec`]: mode-keyed graph descriptions
//! - [`NodeFactory`]: processor constructors keyed by name
//! - [`PipelineGraph`]: the acyclic node graph of one mode
//! - [`PipelineDispatcher`]: per-stream node sequences and their worker
//!
//! # Example
//!
//! ```rust,ignore
//! use campipe::pipeline::{GraphSpec, NodeFactory, PipelineDispatcher, PipelineGraph};
//! use campipe::stream::StreamIntent;
//!
//! let spec = GraphSpec::direct(&[StreamIntent::Preview]);
//! let streams = HashMap::from([(StreamIntent::Preview, stream_id)]);
//! let graph = PipelineGraph::build("preview", &spec, &NodeFactory::new(), &streams)?;
//!
//! let dispatcher = PipelineDispatcher::default();
//! dispatcher.update(graph)?;
//! dispatcher.set_result_callback(stream_id, on_result);
//! dispatcher.start(stream_id)?;
//! dispatcher.deliver_buffer(stream_id, buffer)?;
//! dispatcher.capture(stream_id, capture_id)?;
//! ```

mod dispatcher;
pub mod factory;
mod graph;
mod node;
pub mod spec;

pub use dispatcher::{NodeRef, PipelineDispatcher, ResultCallback};
pub use factory::{NodeConstructor, NodeFactory};
pub use graph::{Link, Node, NodeId, PipelineGraph, Port, PortPeer};
pub use node::{CaptureParams, GateHandle, NodeKind, NodeProcessor, PassThrough, StatusGate};
pub use spec::{GraphSpec, LinkSpec, NodeSpec, PipelineSpec};
