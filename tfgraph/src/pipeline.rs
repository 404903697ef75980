//! End to end driver: device configuration, canonicalization, lowering and
//! assembly of a whole program.

use crate::{
    assembly::{GraphAssembler, GraphAssembly, GraphCodec},
    classifier::{canonicalize, is_tensor_function},
    config::DeviceConfiguration,
    device::DeviceType,
    error::GraphError,
    ir::{Function, Program},
    lowering::{GraphFunctionPool, lower_tf_graph},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Overrides of the configuration found in each function.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub primary_device: Option<DeviceType>,
    pub infeed: Option<bool>,
    /// Erase the configuration op once read.
    pub remove_config_inst: bool,
}

impl PipelineOptions {
    /// The configuration of `func`: what the function declares, overridden by
    /// these options.
    pub fn configure(&self, func: &mut Function) -> Result<DeviceConfiguration, GraphError> {
        let declared = DeviceConfiguration::for_function(func, self.remove_config_inst)?;
        Ok(DeviceConfiguration::new(
            self.primary_device.unwrap_or(declared.primary_device()),
            self.infeed.unwrap_or(declared.infeed_enabled()),
        )?)
    }
}

/// Canonicalizes every tensor op of `func`, resolving its device.
pub fn canonicalize_function(func: &mut Function, config: &mut DeviceConfiguration) -> Result<(), GraphError> {
    let insts = func.iter().collect::<Vec<_>>();
    let mut count = 0;
    for inst in insts {
        if func.is_live(inst) && canonicalize(func, inst, config)?.is_some() {
            count += 1;
        }
    }
    debug!("canonicalized {count} ops in {}", func.name);
    Ok(())
}

#[derive(Clone, Debug)]
pub struct LoweredProgram {
    pub configs: BTreeMap<String, DeviceConfiguration>,
    pub pool: GraphFunctionPool,
    pub assembly: GraphAssembly,
}

impl LoweredProgram {
    pub fn serialize(&self, codec: &dyn GraphCodec) -> Result<Vec<u8>, GraphError> {
        Ok(codec.encode(&self.assembly)?)
    }
}

/// Lowers `entry` and every other function holding tensor code, `entry`
/// first, and assembles the graph reachable from `entry`.
#[instrument(level = "info", skip(program, options))]
pub fn lower_program(program: &Program, entry: &str, options: &PipelineOptions) -> Result<LoweredProgram, GraphError> {
    let mut pool = GraphFunctionPool::new();
    let mut configs = BTreeMap::new();
    let order = program
        .functions
        .iter()
        .filter(|f| f.name == entry)
        .chain(program.functions.iter().filter(|f| f.name != entry));
    for func in order {
        if func.name != entry && !is_tensor_function(func) {
            debug!("skipping host function {}", func.name);
            continue;
        }
        let mut func = func.clone();
        let mut config = options.configure(&mut func)?;
        canonicalize_function(&mut func, &mut config)?;
        lower_tf_graph(&func.name, &func, &config, &mut pool)?;
        configs.insert(func.name.clone(), config);
    }
    let assembly = GraphAssembler::new(&pool).assemble(entry)?;
    info!(
        "lowered {} functions, {} in the graph of {entry}",
        pool.len(),
        assembly.graph.len()
    );
    Ok(LoweredProgram {
        configs,
        pool,
        assembly,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        assembly::JsonCodec,
        ir::{DataType, FunctionBuilder, ValueType},
    };

    #[test]
    fn test_options_override_declared_configuration() {
        let mut b = FunctionBuilder::new("f");
        let on = b.int(1, DataType::Int64);
        b.tensor_op("tfc.configureTPU,enableInfeed", &[on], ValueType::Unit);
        b.ret(&[]);
        let mut func = b.finish();

        let options = PipelineOptions {
            infeed: Some(false),
            ..Default::default()
        };
        let config = options.configure(&mut func).unwrap();
        assert_eq!(config.primary_device(), DeviceType::Tpu);
        assert!(!config.infeed_enabled());

        let options: PipelineOptions = serde_json::from_str(r#"{"primary_device":"Gpu"}"#).unwrap();
        assert_eq!(options.configure(&mut func).unwrap().primary_device(), DeviceType::Gpu);
    }

    #[test]
    fn test_lower_program_resolves_callees() {
        let f32 = ValueType::Tensor(DataType::Float);
        let mut b = FunctionBuilder::new("main");
        let x = b.param(f32.clone());
        let callee = b.function_ref("square");
        let y = b.tensor_op("PartitionedCall,$in,f", &[x, callee], f32.clone());
        b.ret(&[y]);
        let main = b.finish();

        let mut b = FunctionBuilder::new("square");
        let x = b.param(f32.clone());
        let y = b.tensor_op("Square,$in", &[x], f32);
        b.ret(&[y]);
        let square = b.finish();

        let program = Program::new(vec![square, main]);
        let lowered = lower_program(&program, "main", &PipelineOptions::default()).unwrap();
        assert!(lowered.pool["main"].pending.iter().any(|p| p.callee == "square"));
        assert_eq!(
            lowered.assembly.graph.function_names().collect::<Vec<_>>(),
            vec!["main", "square"]
        );
        assert!(!lowered.serialize(&JsonCodec::default()).unwrap().is_empty());

        assert!(matches!(
            lower_program(&program, "missing", &PipelineOptions::default()),
            Err(GraphError::Assembly(_))
        ));
    }

    #[test]
    fn test_configuration_op_stays_out_of_graph() {
        let mut b = FunctionBuilder::new("main");
        b.tensor_op("tfc.configureGPU", &[], ValueType::Unit);
        let x = b.param(ValueType::Tensor(DataType::Float));
        let y = b.tensor_op("Relu,$in", &[x], ValueType::Tensor(DataType::Float));
        b.ret(&[y]);
        let program = Program::new(vec![b.finish()]);

        let lowered = lower_program(&program, "main", &PipelineOptions::default()).unwrap();
        assert_eq!(lowered.configs["main"].primary_device(), DeviceType::Gpu);
        let main = lowered.assembly.graph.function("main").unwrap();
        assert_eq!(main.nodes.iter().map(|n| n.op.as_str()).collect::<Vec<_>>(), vec!["Relu"]);
        assert_eq!(main.nodes[0].device, "/device:GPU:0");
    }

    #[test]
    fn test_host_functions_are_skipped() {
        let int = ValueType::Scalar(DataType::Int64);
        let mut b = FunctionBuilder::new("count");
        let n = b.param(int.clone());
        let m = b.builtin("add_Int64", &[n, n], int);
        b.ret(&[m]);
        let count = b.finish();

        let f32 = ValueType::Tensor(DataType::Float);
        let mut b = FunctionBuilder::new("main");
        let x = b.param(f32.clone());
        let y = b.tensor_op("Relu,$in", &[x], f32);
        b.ret(&[y]);
        let program = Program::new(vec![count, b.finish()]);

        let lowered = lower_program(&program, "main", &PipelineOptions::default()).unwrap();
        assert_eq!(lowered.pool.keys().collect::<Vec<_>>(), vec!["main"]);
        assert!(!lowered.configs.contains_key("count"));
    }
}
