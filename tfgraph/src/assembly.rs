//! Assembly of a closed graph from an entry function and its callees, and its
//! serialization.

use crate::{
    ir::Location,
    lowering::{Graph, GraphFunctionPool},
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, instrument, trace};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("entry function '{name}' was never lowered")]
    MissingEntry { name: String },
    #[error("{loc}: '{caller}' references '{callee}', which was never lowered")]
    MissingCallee {
        callee: String,
        caller: String,
        loc: Location,
    },
}

impl AssemblyError {
    pub fn location(&self) -> Option<&Location> {
        match self {
            AssemblyError::MissingEntry { .. } => None,
            AssemblyError::MissingCallee { loc, .. } => Some(loc),
        }
    }
}

/// The graph of an entry function closed over everything it references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphAssembly {
    /// Graph name of the entry function.
    pub entry: String,
    /// Helpers that must run along with the entry function.
    pub helpers: Vec<String>,
    pub graph: Graph,
}

pub struct GraphAssembler<'a> {
    pool: &'a GraphFunctionPool,
}

impl<'a> GraphAssembler<'a> {
    pub fn new(pool: &'a GraphFunctionPool) -> Self {
        Self { pool }
    }

    /// Collects the graph of `entry` and, transitively, of every function it
    /// references. Each function is copied once.
    #[instrument(level = "debug", skip(self))]
    pub fn assemble(&self, entry: &str) -> Result<GraphAssembly, AssemblyError> {
        let lowered = self.pool.get(entry).ok_or_else(|| AssemblyError::MissingEntry {
            name: entry.to_string(),
        })?;
        let mut graph = lowered.graph.clone();
        let mut visited = HashSet::from([entry.to_string()]);
        let mut worklist = lowered.pending.iter().collect::<VecDeque<_>>();
        while let Some(reference) = worklist.pop_front() {
            if !visited.insert(reference.callee.clone()) {
                continue;
            }
            let callee = self
                .pool
                .get(&reference.callee)
                .ok_or_else(|| AssemblyError::MissingCallee {
                    callee: reference.callee.clone(),
                    caller: reference.caller.clone(),
                    loc: reference.loc.clone(),
                })?;
            trace!("adding {} for {}", callee.graph_fn_name, reference.caller);
            graph.merge_from(&callee.graph);
            worklist.extend(callee.pending.iter());
        }
        debug!("assembled {entry} with {} functions", graph.len());
        Ok(GraphAssembly {
            entry: lowered.graph_fn_name.clone(),
            helpers: lowered.helper_fn_names.clone(),
            graph,
        })
    }
}

/// Copies the graph of `entry` and of everything it references into `dest`.
/// `dest` is left untouched on failure.
pub fn copy_graph_functions(entry: &str, pool: &GraphFunctionPool, dest: &mut Graph) -> Result<(), AssemblyError> {
    let assembly = GraphAssembler::new(pool).assemble(entry)?;
    dest.merge_from(&assembly.graph);
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("failed to encode graph as MessagePack: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode MessagePack graph: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("JSON graph codec failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire format of an assembled graph.
pub trait GraphCodec {
    fn encode(&self, assembly: &GraphAssembly) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<GraphAssembly, CodecError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackCodec;

impl GraphCodec for MsgPackCodec {
    fn encode(&self, assembly: &GraphAssembly) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(assembly)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<GraphAssembly, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec {
    pub pretty: bool,
}

impl GraphCodec for JsonCodec {
    fn encode(&self, assembly: &GraphAssembly) -> Result<Vec<u8>, CodecError> {
        Ok(if self.pretty {
            serde_json::to_vec_pretty(assembly)?
        } else {
            serde_json::to_vec(assembly)?
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<GraphAssembly, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn serialize_graph(assembly: &GraphAssembly, codec: &dyn GraphCodec) -> Result<Vec<u8>, CodecError> {
    codec.encode(assembly)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lowering::{
        AttrValue, FunctionDef, LoweredGraphFunction, NodeDef, PendingReference, TensorValues,
    };

    fn lowered(host: &str, pending: &[&str]) -> LoweredGraphFunction {
        let mut graph = Graph::new();
        let mut def = FunctionDef::new(host);
        def.nodes.push(NodeDef {
            name: "Const_0".into(),
            op: "Const".into(),
            device: "/device:CPU:0".into(),
            attrs: [(
                "value".to_string(),
                AttrValue::Tensor {
                    dtype: crate::ir::DataType::Float,
                    shape: vec![],
                    values: TensorValues::Float(vec![1.5]),
                },
            )]
            .into(),
            ..Default::default()
        });
        graph.insert(def);
        LoweredGraphFunction {
            host_fn_name: host.to_string(),
            graph_fn_name: host.to_string(),
            helper_fn_names: vec![],
            graph,
            pending: pending
                .iter()
                .map(|callee| PendingReference {
                    callee: callee.to_string(),
                    caller: host.to_string(),
                    loc: Location::new("prog.swift", 10, 3),
                })
                .collect(),
        }
    }

    fn pool(entries: Vec<LoweredGraphFunction>) -> GraphFunctionPool {
        entries.into_iter().map(|l| (l.host_fn_name.clone(), l)).collect()
    }

    #[test]
    fn test_transitive_closure() {
        let pool = pool(vec![
            lowered("main", &["a", "b"]),
            lowered("a", &["c"]),
            lowered("b", &["c", "main"]),
            lowered("c", &[]),
            lowered("unused", &[]),
        ]);
        let assembly = GraphAssembler::new(&pool).assemble("main").unwrap();
        assert_eq!(assembly.entry, "main");
        assert_eq!(
            assembly.graph.function_names().collect::<Vec<_>>(),
            vec!["a", "b", "c", "main"]
        );
    }

    #[test]
    fn test_missing_callee_leaves_destination_untouched() {
        let pool = pool(vec![lowered("main", &["a"]), lowered("a", &["gone"])]);
        let mut dest = Graph::new();
        let err = copy_graph_functions("main", &pool, &mut dest).unwrap_err();
        assert_eq!(
            err,
            AssemblyError::MissingCallee {
                callee: "gone".into(),
                caller: "a".into(),
                loc: Location::new("prog.swift", 10, 3),
            }
        );
        assert!(err.to_string().contains("'gone'"));
        assert!(dest.is_empty());

        assert!(matches!(
            GraphAssembler::new(&pool).assemble("nope"),
            Err(AssemblyError::MissingEntry { .. })
        ));
    }

    #[test]
    fn test_codecs() {
        let pool = pool(vec![lowered("main", &[])]);
        let assembly = GraphAssembler::new(&pool).assemble("main").unwrap();
        let codecs: [&dyn GraphCodec; 2] = [&MsgPackCodec, &JsonCodec { pretty: true }];
        for codec in codecs {
            let bytes = serialize_graph(&assembly, codec).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), assembly);
        }
        assert!(MsgPackCodec.decode(b"\xc1").is_err());
    }
}
