//! Lowering of device functions to graph functions.
//!
//! Each tensor op becomes one graph node. Inputs and input lists become node
//! inputs, the other operands become node attributes, and the device
//! attribute becomes the node device. Functions referenced from attributes
//! are copied into the lowered graph when already lowered, or recorded as
//! pending references for the assembler otherwise.

use crate::{
    classifier::{DecodedOperand, OperandRole, OperationDescriptor},
    config::DeviceConfiguration,
    device::{DEFAULT_CPU_DEVICE, DeviceType},
    error::GraphError,
    ir::{ConstantValue, DataType, Function, InstId, InstKind, Location, ValueId, ValueType},
    ops::{
        D2D_RECV, D2D_SEND, DEST_DEVICE_ATTR, DEVICE_ATTR, RECV_FROM_HOST, SCALAR_TO_TENSOR, SEND_TO_HOST,
        SHAPE_ARRAY_ATTR, SRC_DEVICE_ATTR, TENSOR_ID_ATTR, TRANSFER_ID_ATTR, is_configuration,
    },
    partition::DevicePartitioner,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument, trace};

pub use error::LoweringError;
pub use graph::{ArgDef, AttrValue, FunctionDef, Graph, NodeDef, TensorValues};

mod error;
mod graph;

/// A reference to a host function whose graph was not available when the
/// referencing function was lowered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReference {
    /// Host name of the referenced function.
    pub callee: String,
    /// Graph function holding the reference.
    pub caller: String,
    pub loc: Location,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoweredGraphFunction {
    pub host_fn_name: String,
    pub graph_fn_name: String,
    /// Functions for the non-primary devices. They have no inputs or outputs
    /// and must run together with the main function.
    pub helper_fn_names: Vec<String>,
    /// The function itself, its helpers and every callee resolved so far.
    pub graph: Graph,
    pub pending: Vec<PendingReference>,
}

impl LoweredGraphFunction {
    fn new(host_fn_name: &str) -> Self {
        Self {
            host_fn_name: host_fn_name.to_string(),
            graph_fn_name: graph_function_name(host_fn_name),
            helper_fn_names: Vec::new(),
            graph: Graph::new(),
            pending: Vec::new(),
        }
    }

    /// Records a reference to `callee`, copying its graph in when the pool
    /// already has it.
    fn add_reference(&mut self, pool: &GraphFunctionPool, callee: &str, caller: &str, loc: &Location) {
        if callee == self.host_fn_name {
            return;
        }
        match pool.get(callee) {
            Some(lowered) => {
                trace!("copying {} into {}", lowered.graph_fn_name, self.graph_fn_name);
                self.graph.merge_from(&lowered.graph);
                for reference in &lowered.pending {
                    self.add_pending(reference.clone());
                }
            }
            None => self.add_pending(PendingReference {
                callee: callee.to_string(),
                caller: caller.to_string(),
                loc: loc.clone(),
            }),
        }
    }

    fn add_pending(&mut self, reference: PendingReference) {
        if reference.callee != self.host_fn_name
            && !self.pending.iter().any(|p| p.callee == reference.callee)
        {
            self.pending.push(reference);
        }
    }
}

/// Lowered functions, keyed by host function name.
pub type GraphFunctionPool = BTreeMap<String, LoweredGraphFunction>;

/// Graph function name for a host function. Characters the graph does not
/// accept in names are replaced by `_`.
pub fn graph_function_name(host_name: &str) -> String {
    let name: String = host_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() { "_".to_string() } else { name }
}

/// Lowers a function running on a single device, without partitioning.
#[instrument(level = "debug", skip(func, config, pool))]
pub fn lower_tf_function(
    host_name: &str,
    func: &Function,
    config: &DeviceConfiguration,
    pool: &mut GraphFunctionPool,
) -> Result<(), GraphError> {
    ensure_not_lowered(host_name, pool)?;
    let mut lowered = LoweredGraphFunction::new(host_name);
    let name = lowered.graph_fn_name.clone();
    ensure_names_free(host_name, std::slice::from_ref(&name), pool)?;
    FunctionLowering::new(func, config).lower(&name, pool, &mut lowered)?;
    debug!("lowered {host_name} to {name}");
    pool.insert(host_name.to_string(), lowered);
    Ok(())
}

/// Partitions `func` by device and lowers every device function. The primary
/// device function gets the graph name of `host_name`, the others become
/// `<name>_helper_<i>` helpers.
#[instrument(level = "debug", skip(func, config, pool))]
pub fn lower_tf_graph(
    host_name: &str,
    func: &Function,
    config: &DeviceConfiguration,
    pool: &mut GraphFunctionPool,
) -> Result<(), GraphError> {
    ensure_not_lowered(host_name, pool)?;
    let partition = DevicePartitioner::new(func, config).partition()?;
    let mut lowered = LoweredGraphFunction::new(host_name);
    let functions = partition.into_functions();
    lowered.helper_fn_names = (1..functions.len())
        .map(|i| format!("{}_helper_{}", lowered.graph_fn_name, i - 1))
        .collect();
    let names = std::iter::once(lowered.graph_fn_name.clone())
        .chain(lowered.helper_fn_names.iter().cloned())
        .collect::<Vec<_>>();
    ensure_names_free(host_name, &names, pool)?;
    for (partitioned, name) in functions.into_iter().zip(&names) {
        trace!("lowering {} part as {name}", partitioned.device);
        FunctionLowering::new(&partitioned.function, config).lower(name, pool, &mut lowered)?;
    }
    debug!(
        "lowered {host_name} to {} with {} helpers",
        lowered.graph_fn_name,
        lowered.helper_fn_names.len()
    );
    pool.insert(host_name.to_string(), lowered);
    Ok(())
}

fn ensure_not_lowered(host_name: &str, pool: &GraphFunctionPool) -> Result<(), LoweringError> {
    if pool.contains_key(host_name) {
        return Err(LoweringError::AlreadyLowered {
            name: host_name.to_string(),
        });
    }
    Ok(())
}

/// Graph names are flattened from host names, so two host functions may map
/// to the same graph function. Such a collision is an error.
fn ensure_names_free(host_name: &str, names: &[String], pool: &GraphFunctionPool) -> Result<(), LoweringError> {
    for other in pool.values() {
        let mut taken = std::iter::once(&other.graph_fn_name).chain(&other.helper_fn_names);
        if let Some(name) = taken.find(|taken| names.contains(*taken)) {
            return Err(LoweringError::NameCollision {
                name: name.clone(),
                host: host_name.to_string(),
                owner: other.host_fn_name.clone(),
            });
        }
    }
    Ok(())
}

struct FunctionLowering<'a> {
    func: &'a Function,
    config: &'a DeviceConfiguration,
    def: FunctionDef,
    /// Graph tensor name of each lowered value.
    tensors: HashMap<ValueId, String>,
    references: Vec<(String, Location)>,
}

impl<'a> FunctionLowering<'a> {
    fn new(func: &'a Function, config: &'a DeviceConfiguration) -> Self {
        Self {
            func,
            config,
            def: FunctionDef::default(),
            tensors: HashMap::new(),
            references: Vec::new(),
        }
    }

    fn lower(
        mut self,
        name: &str,
        pool: &GraphFunctionPool,
        lowered: &mut LoweredGraphFunction,
    ) -> Result<(), GraphError> {
        self.def.name = name.to_string();
        let func = self.func;
        for inst in func.iter() {
            let loc = func.loc(inst);
            match func.kind(inst) {
                InstKind::Param { index, ty } => {
                    let arg = format!("arg{index}");
                    let dtype = self.data_type(ty, loc, "parameter")?;
                    self.def.inputs.push(ArgDef {
                        name: arg.clone(),
                        dtype,
                    });
                    self.tensors.insert(inst, arg);
                }
                InstKind::Return { values } => {
                    for (i, value) in values.iter().enumerate() {
                        let output = format!("ret{i}");
                        let dtype = self.data_type(&func.result_type(*value), loc, "result")?;
                        let tensor = self.tensors.get(value).cloned().ok_or_else(|| {
                            LoweringError::UnsupportedInstruction {
                                what: format!("return of {value}, which is not a graph tensor"),
                                loc: loc.clone(),
                            }
                        })?;
                        self.def.outputs.push(ArgDef {
                            name: output.clone(),
                            dtype,
                        });
                        self.def.ret.insert(output, tensor);
                    }
                }
                kind if kind.tensor_op_name().is_some_and(is_configuration) => {}
                InstKind::Builtin { .. } => {
                    if let Some(descriptor) = OperationDescriptor::decode(func, inst)? {
                        let node = self.lower_op(inst, &descriptor)?;
                        if func.result_type(inst) != ValueType::Unit {
                            self.tensors.insert(inst, node.name.clone());
                        }
                        self.def.nodes.push(node);
                    }
                }
                // Literals are folded into the attributes using them.
                _ => {}
            }
        }
        for (callee, loc) in &self.references {
            lowered.add_reference(pool, callee, name, loc);
        }
        trace!("{name}: {} nodes", self.def.nodes.len());
        lowered.graph.insert(self.def);
        Ok(())
    }

    fn lower_op(&mut self, inst: InstId, descriptor: &OperationDescriptor) -> Result<NodeDef, GraphError> {
        let func = self.func;
        let op = descriptor.op_name();
        let loc = func.loc(inst);
        let device = match descriptor.device() {
            None => {
                return Err(LoweringError::MissingDevice {
                    op: op.to_string(),
                    loc: loc.clone(),
                }
                .into());
            }
            Some(DeviceType::All) => {
                return Err(LoweringError::AllDevicesInGraph {
                    op: op.to_string(),
                    loc: loc.clone(),
                }
                .into());
            }
            Some(device) => device.device_string().ok_or_else(|| LoweringError::MissingDevice {
                op: op.to_string(),
                loc: loc.clone(),
            })?,
        };

        let mut node = NodeDef {
            name: String::new(),
            op: String::new(),
            inputs: Vec::new(),
            device: device.to_string(),
            attrs: BTreeMap::new(),
        };
        let mut attr = |name: &str, value: AttrValue| {
            node.attrs.insert(name.to_string(), value);
        };
        let graph_op = match op {
            D2D_SEND => {
                let id = self.int_attribute(descriptor, TRANSFER_ID_ATTR, loc)?;
                attr("tensor_name", AttrValue::Str(format!("transfer_{id}")));
                attr("send_device", AttrValue::Str(device.to_string()));
                attr(
                    "recv_device",
                    AttrValue::Str(self.string_attribute(descriptor, DEST_DEVICE_ATTR, loc)?),
                );
                attr("send_device_incarnation", AttrValue::Int(0));
                attr("client_terminated", AttrValue::Bool(false));
                attr("T", AttrValue::Type(self.input_type(descriptor, loc)?));
                "_Send"
            }
            D2D_RECV => {
                let id = self.int_attribute(descriptor, TRANSFER_ID_ATTR, loc)?;
                attr("tensor_name", AttrValue::Str(format!("transfer_{id}")));
                attr(
                    "send_device",
                    AttrValue::Str(self.string_attribute(descriptor, SRC_DEVICE_ATTR, loc)?),
                );
                attr("recv_device", AttrValue::Str(device.to_string()));
                attr("send_device_incarnation", AttrValue::Int(0));
                attr("client_terminated", AttrValue::Bool(false));
                attr(
                    "tensor_type",
                    AttrValue::Type(self.data_type(&self.func.result_type(inst), loc, "received value")?),
                );
                "_Recv"
            }
            RECV_FROM_HOST | SEND_TO_HOST if self.config.uses_infeed() => {
                let shapes = descriptor
                    .groups()
                    .into_iter()
                    .find(|g| g.head.role == OperandRole::ShapeArray && g.head.name == SHAPE_ARRAY_ATTR)
                    .ok_or_else(|| LoweringError::MissingAttribute {
                        op: op.to_string(),
                        name: SHAPE_ARRAY_ATTR.to_string(),
                        loc: loc.clone(),
                    })?;
                let dtype = if op == RECV_FROM_HOST {
                    self.data_type(&self.func.result_type(inst), loc, "received value")?
                } else {
                    self.input_type(descriptor, loc)?
                };
                attr("dtypes", AttrValue::List(vec![AttrValue::Type(dtype)]));
                attr("shapes", AttrValue::ShapeList(self.shape_list(op, shapes.elements, loc)?));
                if op == RECV_FROM_HOST {
                    "InfeedDequeueTuple"
                } else {
                    "OutfeedEnqueueTuple"
                }
            }
            RECV_FROM_HOST => {
                let id = self.int_attribute(descriptor, TENSOR_ID_ATTR, loc)?;
                attr("tensor_name", AttrValue::Str(format!("host_transfer_{id}")));
                attr("send_device", AttrValue::Str(DEFAULT_CPU_DEVICE.to_string()));
                attr("recv_device", AttrValue::Str(device.to_string()));
                attr("send_device_incarnation", AttrValue::Int(0));
                attr("client_terminated", AttrValue::Bool(true));
                attr(
                    "tensor_type",
                    AttrValue::Type(self.data_type(&self.func.result_type(inst), loc, "received value")?),
                );
                "_HostRecv"
            }
            SEND_TO_HOST => {
                let id = self.int_attribute(descriptor, TENSOR_ID_ATTR, loc)?;
                attr("tensor_name", AttrValue::Str(format!("host_transfer_{id}")));
                attr("send_device", AttrValue::Str(device.to_string()));
                attr("recv_device", AttrValue::Str(DEFAULT_CPU_DEVICE.to_string()));
                attr("send_device_incarnation", AttrValue::Int(0));
                attr("client_terminated", AttrValue::Bool(true));
                attr("T", AttrValue::Type(self.input_type(descriptor, loc)?));
                "_HostSend"
            }
            SCALAR_TO_TENSOR => {
                let scalar = descriptor
                    .inputs()
                    .next()
                    .and_then(|v| self.func.constant_value(v))
                    .filter(ConstantValue::is_numeric)
                    .ok_or_else(|| LoweringError::NonConstantScalar {
                        op: op.to_string(),
                        loc: loc.clone(),
                    })?;
                let dtype = self.data_type(&self.func.result_type(inst), loc, "promoted scalar")?;
                attr(
                    "value",
                    AttrValue::Tensor {
                        dtype,
                        shape: vec![],
                        values: self.tensor_values(op, "value", dtype, &[scalar], loc)?,
                    },
                );
                attr("dtype", AttrValue::Type(dtype));
                "Const"
            }
            _ => {
                for (name, value) in self.generic_attributes(descriptor, loc)? {
                    attr(&name, value);
                }
                op
            }
        };
        node.op = graph_op.to_string();
        node.name = format!("{graph_op}_{}", inst.0);
        if !matches!(op, D2D_RECV | RECV_FROM_HOST | SCALAR_TO_TENSOR) {
            node.inputs = descriptor
                .inputs()
                .map(|v| self.tensor_name(op, v, loc))
                .collect::<Result<_, _>>()?;
        }
        trace!("{inst} -> {} ({})", node.name, node.device);
        Ok(node)
    }

    /// Attributes of an op without special lowering.
    fn generic_attributes(
        &mut self,
        descriptor: &OperationDescriptor,
        loc: &Location,
    ) -> Result<Vec<(String, AttrValue)>, LoweringError> {
        let op = descriptor.op_name();
        let mut attrs = Vec::new();
        for group in descriptor.groups() {
            let head = group.head;
            let value = match head.role {
                OperandRole::Input
                | OperandRole::ScalarInput
                | OperandRole::InputList
                | OperandRole::InputElt
                | OperandRole::ArrayElement => continue,
                OperandRole::Normal if head.name == DEVICE_ATTR => continue,
                // Only infeed and outfeed keep the transfer shapes.
                OperandRole::ShapeArray if head.name == SHAPE_ARRAY_ATTR => continue,
                OperandRole::Normal => {
                    let constant = self.constant(op, head, loc)?;
                    self.attr_value(op, &head.name, constant, loc)?
                }
                OperandRole::DType => {
                    let code = self.constant(op, head, loc)?.as_int().unwrap_or(-1);
                    AttrValue::Type(DataType::from_code(code).ok_or_else(|| LoweringError::InvalidDType {
                        op: op.to_string(),
                        name: head.name.clone(),
                        code,
                        loc: loc.clone(),
                    })?)
                }
                OperandRole::Tensor => self.tensor_attribute(op, head, group.elements, loc)?,
                OperandRole::Shape => AttrValue::Shape(self.int_elements(op, &head.name, group.elements, loc)?),
                OperandRole::Array => {
                    let elements = group
                        .elements
                        .iter()
                        .map(|e| {
                            let constant = self.constant(op, e, loc)?;
                            self.attr_value(op, &head.name, constant, loc)
                        })
                        .collect::<Result<_, _>>()?;
                    AttrValue::List(elements)
                }
                OperandRole::ShapeArray => AttrValue::ShapeList(self.shape_list(op, group.elements, loc)?),
            };
            attrs.push((head.name.clone(), value));
        }
        Ok(attrs)
    }

    fn tensor_attribute(
        &self,
        op: &str,
        head: &DecodedOperand,
        elements: &[DecodedOperand],
        loc: &Location,
    ) -> Result<AttrValue, LoweringError> {
        let head_value = self.value(op, head, loc)?;
        if let InstKind::Metatype(element) = self.func.kind(head_value) {
            let dtype = self.data_type(element, loc, "tensor element")?;
            let constants = elements
                .iter()
                .map(|e| self.constant(op, e, loc))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(AttrValue::Tensor {
                dtype,
                shape: vec![constants.len() as i64],
                values: self.tensor_values(op, &head.name, dtype, &constants, loc)?,
            });
        }
        let constant = self.constant(op, head, loc)?;
        let dtype = match &constant {
            ConstantValue::Int { dtype, .. } | ConstantValue::Float { dtype, .. } => *dtype,
            _ => {
                return Err(LoweringError::InvalidAttribute {
                    op: op.to_string(),
                    name: head.name.clone(),
                    reason: "is not a numeric constant".to_string(),
                    loc: loc.clone(),
                });
            }
        };
        Ok(AttrValue::Tensor {
            dtype,
            shape: vec![],
            values: self.tensor_values(op, &head.name, dtype, &[constant], loc)?,
        })
    }

    fn tensor_values(
        &self,
        op: &str,
        name: &str,
        dtype: DataType,
        constants: &[ConstantValue],
        loc: &Location,
    ) -> Result<TensorValues, LoweringError> {
        let invalid = |reason: &str| LoweringError::InvalidAttribute {
            op: op.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
            loc: loc.clone(),
        };
        if dtype.is_floating_point() {
            constants
                .iter()
                .map(|c| match c {
                    ConstantValue::Float { value, .. } => Ok(*value),
                    ConstantValue::Int { value, .. } => Ok(*value as f64),
                    _ => Err(invalid("holds a non numeric element")),
                })
                .collect::<Result<_, _>>()
                .map(TensorValues::Float)
        } else {
            constants
                .iter()
                .map(|c| match c {
                    ConstantValue::Int { value, .. } => Ok(*value),
                    ConstantValue::Float { .. } => Err(invalid("holds a floating point value in an integer tensor")),
                    _ => Err(invalid("holds a non numeric element")),
                })
                .collect::<Result<_, _>>()
                .map(TensorValues::Int)
        }
    }

    fn attr_value(
        &mut self,
        op: &str,
        name: &str,
        constant: ConstantValue,
        loc: &Location,
    ) -> Result<AttrValue, LoweringError> {
        Ok(match constant {
            ConstantValue::Int {
                value,
                dtype: DataType::Bool,
            } => AttrValue::Bool(value != 0),
            ConstantValue::Int { value, .. } => AttrValue::Int(value),
            ConstantValue::Float { value, .. } => AttrValue::Float(value),
            ConstantValue::Str(s) => AttrValue::Str(s),
            ConstantValue::Type(ty) => AttrValue::Type(self.data_type(&ty, loc, "type attribute")?),
            ConstantValue::Function(host) => {
                self.references.push((host.clone(), loc.clone()));
                AttrValue::Func(graph_function_name(&host))
            }
            ConstantValue::Array { elements, .. } => AttrValue::List(
                elements
                    .into_iter()
                    .map(|e| self.attr_value(op, name, e, loc))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Shapes of a shape array, from its flat list of shape markers and
    /// dimensions.
    fn shape_list(&self, op: &str, elements: &[DecodedOperand], loc: &Location) -> Result<Vec<Vec<i64>>, LoweringError> {
        let mut shapes: Vec<Vec<i64>> = Vec::new();
        for element in elements {
            match element.role {
                OperandRole::Shape => shapes.push(Vec::new()),
                _ => {
                    let dim = self.constant(op, element, loc)?.as_int();
                    match (shapes.last_mut(), dim) {
                        (Some(shape), Some(dim)) => shape.push(dim),
                        _ => {
                            return Err(LoweringError::InvalidAttribute {
                                op: op.to_string(),
                                name: SHAPE_ARRAY_ATTR.to_string(),
                                reason: "is not a list of integer shapes".to_string(),
                                loc: loc.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(shapes)
    }

    fn int_elements(
        &self,
        op: &str,
        name: &str,
        elements: &[DecodedOperand],
        loc: &Location,
    ) -> Result<Vec<i64>, LoweringError> {
        elements
            .iter()
            .map(|e| {
                self.constant(op, e, loc)?
                    .as_int()
                    .ok_or_else(|| LoweringError::InvalidAttribute {
                        op: op.to_string(),
                        name: name.to_string(),
                        reason: "holds a non integer dimension".to_string(),
                        loc: loc.clone(),
                    })
            })
            .collect()
    }

    fn value(&self, op: &str, operand: &DecodedOperand, loc: &Location) -> Result<ValueId, LoweringError> {
        operand.value().ok_or_else(|| LoweringError::NotCanonical {
            op: op.to_string(),
            loc: loc.clone(),
        })
    }

    fn constant(&self, op: &str, operand: &DecodedOperand, loc: &Location) -> Result<ConstantValue, LoweringError> {
        let value = self.value(op, operand, loc)?;
        self.func
            .constant_value(value)
            .ok_or_else(|| LoweringError::InvalidAttribute {
                op: op.to_string(),
                name: operand.name.clone(),
                reason: "is not a constant".to_string(),
                loc: loc.clone(),
            })
    }

    fn int_attribute(&self, descriptor: &OperationDescriptor, name: &str, loc: &Location) -> Result<i64, LoweringError> {
        descriptor
            .int_attribute(self.func, name)
            .ok_or_else(|| LoweringError::MissingAttribute {
                op: descriptor.op_name().to_string(),
                name: name.to_string(),
                loc: loc.clone(),
            })
    }

    fn string_attribute(
        &self,
        descriptor: &OperationDescriptor,
        name: &str,
        loc: &Location,
    ) -> Result<String, LoweringError> {
        descriptor
            .string_attribute(self.func, name)
            .ok_or_else(|| LoweringError::MissingAttribute {
                op: descriptor.op_name().to_string(),
                name: name.to_string(),
                loc: loc.clone(),
            })
    }

    /// Data type of the first input of the op.
    fn input_type(&self, descriptor: &OperationDescriptor, loc: &Location) -> Result<DataType, LoweringError> {
        let input = descriptor
            .inputs()
            .next()
            .ok_or_else(|| LoweringError::UnsupportedInstruction {
                what: format!("'{}' without input", descriptor.op_name()),
                loc: loc.clone(),
            })?;
        self.data_type(&self.func.result_type(input), loc, "input")
    }

    fn data_type(&self, ty: &ValueType, loc: &Location, what: &str) -> Result<DataType, LoweringError> {
        ty.data_type()
            .ok_or_else(|| LoweringError::UnsupportedInstruction {
                what: format!("{what} of type {ty:?}"),
                loc: loc.clone(),
            })
    }

    fn tensor_name(&self, op: &str, value: ValueId, loc: &Location) -> Result<String, LoweringError> {
        self.tensors
            .get(&value)
            .cloned()
            .ok_or_else(|| LoweringError::UnloweredInput {
                op: op.to_string(),
                value,
                loc: loc.clone(),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{classifier::canonicalize, ir::FunctionBuilder};

    const F32: ValueType = ValueType::Tensor(DataType::Float);

    fn canonical(mut func: Function, config: &mut DeviceConfiguration) -> Function {
        for inst in func.iter().collect::<Vec<_>>() {
            canonicalize(&mut func, inst, config).unwrap();
        }
        func
    }

    #[test]
    fn test_graph_function_names() {
        assert_eq!(graph_function_name("main"), "main");
        assert_eq!(graph_function_name("$s4main3fooyyF"), "_s4main3fooyyF");
        assert_eq!(graph_function_name("a.b-c"), "a_b_c");
        assert_eq!(graph_function_name(""), "_");
    }

    #[test]
    fn test_lower_single_device_function() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(F32);
        let shape = b.int_array(&[2, 2]);
        let r = b.tensor_op("Reshape,$in,shape$shape", &[x, shape], F32);
        let t = b.int(DataType::Float.code(), DataType::Int64);
        let c = b.tensor_op("Cast,$in,DstT$dtype", &[r, t], F32);
        b.ret(&[c]);
        let mut config = DeviceConfiguration::new(DeviceType::Gpu, false).unwrap();
        let func = canonical(b.finish(), &mut config);

        let mut pool = GraphFunctionPool::new();
        lower_tf_function("f", &func, &config, &mut pool).unwrap();
        let lowered = &pool["f"];
        let def = lowered.graph.function("f").unwrap();
        assert_eq!(def.inputs, vec![ArgDef { name: "arg0".into(), dtype: DataType::Float }]);
        assert_eq!(def.nodes.len(), 2);
        let reshape = &def.nodes[0];
        assert_eq!(reshape.op, "Reshape");
        assert_eq!(reshape.inputs, vec!["arg0".to_string()]);
        assert_eq!(reshape.device, "/device:GPU:0");
        assert_eq!(reshape.attr("shape"), Some(&AttrValue::Shape(vec![2, 2])));
        assert!(reshape.attr(DEVICE_ATTR).is_none());
        assert_eq!(def.ret["ret0"], def.nodes[1].name);
        assert!(lowered.helper_fn_names.is_empty());

        assert!(matches!(
            lower_tf_function("f", &func, &config, &mut pool),
            Err(GraphError::Lowering(LoweringError::AlreadyLowered { .. }))
        ));
    }

    #[test]
    fn test_dtype_and_tensor_attributes() {
        let mut b = FunctionBuilder::new("f");
        let two = b.float(2.0, DataType::Float);
        let three = b.int(3, DataType::Float);
        let values = b.array(ValueType::Scalar(DataType::Float), &[two, three]);
        let dtype = b.int(DataType::Float.code(), DataType::Int64);
        let c = b.tensor_op("Const,value$tensor,dtype$dtype", &[values, dtype], F32);
        b.ret(&[c]);
        let mut config = DeviceConfiguration::new(DeviceType::Cpu, false).unwrap();
        let func = canonical(b.finish(), &mut config);

        let mut pool = GraphFunctionPool::new();
        lower_tf_function("f", &func, &config, &mut pool).unwrap();
        let node = &pool["f"].graph.function("f").unwrap().nodes[0];
        assert_eq!(node.attr("dtype"), Some(&AttrValue::Type(DataType::Float)));
        assert_eq!(
            node.attr("value"),
            Some(&AttrValue::Tensor {
                dtype: DataType::Float,
                shape: vec![2],
                values: TensorValues::Float(vec![2.0, 3.0]),
            })
        );
    }

    #[test]
    fn test_invalid_dtype_code() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(F32);
        let bad = b.int(8, DataType::Int64);
        let c = b.tensor_op("Cast,$in,DstT$dtype", &[x, bad], F32);
        b.ret(&[c]);
        let mut config = DeviceConfiguration::new(DeviceType::Cpu, false).unwrap();
        let func = canonical(b.finish(), &mut config);

        let err = lower_tf_function("f", &func, &config, &mut GraphFunctionPool::new()).unwrap_err();
        assert!(matches!(
            err,
            GraphError::Lowering(LoweringError::InvalidDType { code: 8, .. })
        ));
    }

    #[test]
    fn test_missing_and_all_devices() {
        let config = DeviceConfiguration::new(DeviceType::Cpu, false).unwrap();
        let mut b = FunctionBuilder::new("f");
        let x = b.param(F32);
        let y = b.tensor_op("Neg,$in", &[x], F32);
        b.ret(&[y]);
        let err = lower_tf_function("f", &b.finish(), &config, &mut GraphFunctionPool::new()).unwrap_err();
        assert!(matches!(err, GraphError::Lowering(LoweringError::MissingDevice { .. })));

        let mut b = FunctionBuilder::new("g");
        let x = b.param(F32);
        let all = b.string("ALL_DEVICES");
        let y = b.tensor_op("Neg,$in,__device", &[x, all], F32);
        b.ret(&[y]);
        let err = lower_tf_function("g", &b.finish(), &config, &mut GraphFunctionPool::new()).unwrap_err();
        assert!(matches!(err, GraphError::Lowering(LoweringError::AllDevicesInGraph { .. })));
    }

    fn caller(name: &str, callee: &str) -> Function {
        let mut b = FunctionBuilder::new(name);
        let x = b.param(F32);
        let f = b.function_ref(callee);
        b.at(Location::new("main.swift", 4, 2));
        let y = b.tensor_op("PartitionedCall,$in,f", &[x, f], F32);
        b.ret(&[y]);
        b.finish()
    }

    #[test]
    fn test_function_reference_resolution() {
        let mut config = DeviceConfiguration::new(DeviceType::Cpu, false).unwrap();
        let mut pool = GraphFunctionPool::new();

        // Callee not lowered yet: the reference stays pending.
        let main = canonical(caller("main", "helper.fn"), &mut config);
        lower_tf_graph("main", &main, &config, &mut pool).unwrap();
        let lowered = &pool["main"];
        assert_eq!(lowered.pending.len(), 1);
        assert_eq!(lowered.pending[0].callee, "helper.fn");
        assert_eq!(lowered.pending[0].loc, Location::new("main.swift", 4, 2));
        let node = &lowered.graph.function("main").unwrap().nodes[0];
        assert_eq!(node.attr("f"), Some(&AttrValue::Func("helper_fn".into())));

        // Callee lowered first: it is copied in right away.
        let mut b = FunctionBuilder::new("leaf");
        let x = b.param(F32);
        let cpu = b.string("/device:CPU:0");
        let y = b.tensor_op("Neg,$in,__device", &[x, cpu], F32);
        b.ret(&[y]);
        lower_tf_function("leaf", &b.finish(), &config, &mut pool).unwrap();
        let other = canonical(caller("other", "leaf"), &mut config);
        lower_tf_graph("other", &other, &config, &mut pool).unwrap();
        let lowered = &pool["other"];
        assert!(lowered.pending.is_empty());
        assert!(lowered.graph.contains("leaf"));
        assert!(lowered.graph.contains("other"));
    }

    #[test]
    fn test_host_transfers_and_infeed() {
        let build = || {
            let mut b = FunctionBuilder::new("f");
            let id = b.int(0, DataType::Int64);
            let shape = b.int_array(&[2]);
            let shapes = b.array(ValueType::Array(Box::new(ValueType::Scalar(DataType::Int64))), &[shape]);
            let recv = b.tensor_op("tfc.RecvFromHost,tensorId,__shapes$shapearray", &[id, shapes], F32);
            let tpu = b.string("TPU_SYSTEM");
            let y = b.tensor_op("Neg,$in,__device", &[recv, tpu], F32);
            b.ret(&[y]);
            b.finish()
        };

        let mut config = DeviceConfiguration::new(DeviceType::Tpu, true).unwrap();
        let func = canonical(build(), &mut config);
        // Host transfers are pinned to the CPU unless infeed moves them.
        assert_eq!(config.used_devices(), &[DeviceType::Tpu, DeviceType::Cpu]);
        let mut pool = GraphFunctionPool::new();
        lower_tf_graph("f", &func, &config, &mut pool).unwrap();
        let graph = &pool["f"].graph;
        let helper = graph.function("f_helper_0").unwrap();
        let infeed = helper.nodes_of("InfeedDequeueTuple").next().unwrap();
        assert_eq!(infeed.attr("shapes"), Some(&AttrValue::ShapeList(vec![vec![2]])));
        assert!(infeed.inputs.is_empty());
        assert_eq!(graph.function("f").unwrap().nodes_of("_Recv").count(), 1);

        let mut config = DeviceConfiguration::new(DeviceType::Tpu, false).unwrap();
        let func = canonical(build(), &mut config);
        let mut pool = GraphFunctionPool::new();
        lower_tf_graph("f", &func, &config, &mut pool).unwrap();
        let helper = pool["f"].graph.function("f_helper_0").unwrap();
        let recv = helper.nodes_of("_HostRecv").next().unwrap();
        assert_eq!(recv.attr("tensor_name").and_then(AttrValue::as_str), Some("host_transfer_0"));
        assert!(recv.attr(SHAPE_ARRAY_ATTR).is_none());
        assert!(recv.attr("shapes").is_none());
    }

    #[test]
    fn test_configuration_op_is_not_lowered() {
        let mut b = FunctionBuilder::new("f");
        b.tensor_op("tfc.configureGPU", &[], ValueType::Unit);
        let x = b.param(F32);
        let y = b.tensor_op("Relu,$in", &[x], F32);
        b.ret(&[y]);
        let mut config = DeviceConfiguration::new(DeviceType::Gpu, false).unwrap();
        let func = canonical(b.finish(), &mut config);

        let mut pool = GraphFunctionPool::new();
        lower_tf_function("f", &func, &config, &mut pool).unwrap();
        lower_tf_graph("g", &func, &config, &mut pool).unwrap();
        for name in ["f", "g"] {
            let def = pool[name].graph.function(name).unwrap();
            assert_eq!(def.nodes.iter().map(|n| n.op.as_str()).collect::<Vec<_>>(), vec!["Relu"]);
            assert_eq!(def.nodes[0].device, "/device:GPU:0");
        }
    }

    fn two_device_function(name: &str) -> (Function, DeviceConfiguration) {
        let mut b = FunctionBuilder::new(name);
        let x = b.param(F32);
        let gpu = b.string("/device:GPU:0");
        let y = b.tensor_op("Neg,$in,__device", &[x, gpu], F32);
        b.ret(&[y]);
        let mut config = DeviceConfiguration::new(DeviceType::Cpu, false).unwrap();
        let func = canonical(b.finish(), &mut config);
        (func, config)
    }

    #[test]
    fn test_graph_name_collisions() {
        let (func, config) = two_device_function("f");

        let mut pool = GraphFunctionPool::new();
        lower_tf_graph("a.b", &func, &config, &mut pool).unwrap();
        let err = lower_tf_graph("a_b", &func, &config, &mut pool).unwrap_err();
        let GraphError::Lowering(err) = err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(
            err,
            LoweringError::NameCollision {
                name: "a_b".into(),
                host: "a_b".into(),
                owner: "a.b".into(),
            }
        );
        assert!(!pool.contains_key("a_b"));
        let err = lower_tf_function("a-b", &func, &config, &mut pool).unwrap_err();
        assert!(matches!(err, GraphError::Lowering(LoweringError::NameCollision { .. })));

        // A helper may not take the name of another function, in either order.
        let mut pool = GraphFunctionPool::new();
        lower_tf_function("main_helper_0", &func, &config, &mut pool).unwrap();
        let err = lower_tf_graph("main", &func, &config, &mut pool).unwrap_err();
        assert!(matches!(
            err,
            GraphError::Lowering(LoweringError::NameCollision { name, host, owner })
                if name == "main_helper_0" && host == "main" && owner == "main_helper_0"
        ));

        let mut pool = GraphFunctionPool::new();
        lower_tf_graph("main", &func, &config, &mut pool).unwrap();
        assert_eq!(pool["main"].helper_fn_names, vec!["main_helper_0".to_string()]);
        let err = lower_tf_function("main_helper_0", &func, &config, &mut pool).unwrap_err();
        assert!(matches!(
            err,
            GraphError::Lowering(LoweringError::NameCollision { owner, .. }) if owner == "main"
        ));
    }
}
