//! Rewriting tensor ops into their canonical, unfolded form.

use super::{OperandRole, OperandSource, OperationDescriptor, encode_attribute_name};
use crate::{
    config::DeviceConfiguration,
    error::GraphError,
    ir::{DataType, Function, InstId, InstKind, Location, TFOP_PREFIX, ValueId, ValueType},
    ops::{DEVICE_ATTR, is_configuration},
};
use itertools::Itertools;
use std::collections::HashSet;
use tracing::{instrument, trace};

/// A tensor op under construction: its op name plus one mnemonic token per
/// operand pushed so far.
#[derive(Clone, Debug)]
pub struct OpBuilder {
    op_name: String,
    tokens: Vec<String>,
    operands: Vec<ValueId>,
}

impl OpBuilder {
    pub fn new(op_name: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            tokens: Vec::new(),
            operands: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &str, role: OperandRole, value: ValueId) {
        self.tokens.push(encode_attribute_name(name, role));
        self.operands.push(value);
    }

    /// Materializes `device` as a string literal right before `anchor` and
    /// appends it as the op's device attribute.
    pub fn append_device_attribute(&mut self, func: &mut Function, anchor: InstId, device: &str) {
        let loc = func.loc(anchor).clone();
        let value = func.insert_before(anchor, InstKind::StringLiteral(device.to_string()), loc);
        self.push(DEVICE_ATTR, OperandRole::Normal, value);
    }

    pub fn mnemonic(&self) -> String {
        std::iter::once(self.op_name.as_str())
            .chain(self.tokens.iter().map(String::as_str))
            .join(",")
    }

    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    pub fn build(self, result: ValueType) -> InstKind {
        InstKind::Builtin {
            name: format!("{TFOP_PREFIX}{}", self.mnemonic()),
            operands: self.operands,
            result,
        }
    }
}

/// Rewrites the tensor op `inst` so that every array operand is unfolded and
/// its device attribute is resolved. Returns the descriptor of the rewritten
/// op, or `None` when `inst` is not a tensor op or is a configuration op,
/// which stays as is.
#[instrument(level = "trace", skip(func, config), fields(func = %func.name))]
pub fn canonicalize(
    func: &mut Function,
    inst: InstId,
    config: &mut DeviceConfiguration,
) -> Result<Option<OperationDescriptor>, GraphError> {
    if func.kind(inst).tensor_op_name().is_some_and(is_configuration) {
        return Ok(None);
    }
    let Some(descriptor) = OperationDescriptor::decode(func, inst)? else {
        return Ok(None);
    };
    let loc = func.loc(inst).clone();
    let explicit_device = descriptor
        .string_attribute(func, DEVICE_ATTR)
        .unwrap_or_default();
    let old_device = descriptor.attribute(DEVICE_ATTR).and_then(|o| o.value());

    let mut builder = OpBuilder::new(descriptor.op_name());
    for operand in descriptor.operands() {
        if operand.role == OperandRole::Normal && operand.name == DEVICE_ATTR {
            continue;
        }
        let value = match &operand.source {
            OperandSource::Value(value) => *value,
            OperandSource::Marker(element) => {
                func.insert_before(inst, InstKind::Metatype(element.clone()), loc.clone())
            }
            OperandSource::Count(count) => func.insert_before(
                inst,
                InstKind::IntLiteral {
                    value: *count as i64,
                    dtype: DataType::Int64,
                },
                loc.clone(),
            ),
        };
        builder.push(&operand.name, operand.role, value);
    }
    config.handle_device_placement(descriptor.op_name(), &explicit_device, func, inst, &mut builder)?;

    let result = func.result_type(inst);
    func.replace(inst, builder.build(result));
    if let Some(old) = old_device.filter(|v| func.users(*v).is_empty()) {
        func.erase(old);
    }
    for array in descriptor.unfolded_arrays() {
        remove_or_destroy_array_value(func, *array, &loc, inst);
    }
    trace!("canonicalized {} at {loc}", descriptor.op_name());
    Ok(OperationDescriptor::decode(func, inst)?)
}

/// Tears down an array whose use by `anchor` was dropped. The build chain is
/// erased when nothing else uses it, otherwise the array is released with a
/// `Destroy` placed before `anchor`. Arrays nested in an erased chain get the
/// same treatment.
pub fn remove_or_destroy_array_value(func: &mut Function, array: ValueId, loc: &Location, anchor: InstId) {
    if !func.is_live(array) {
        return;
    }
    let erasable = func
        .users(array)
        .is_empty()
        .then(|| func.array_elements(array))
        .flatten()
        .filter(|elements| {
            let chain: HashSet<_> = elements.chain.iter().copied().collect();
            elements.chain[1..]
                .iter()
                .all(|link| func.users(*link).iter().all(|user| chain.contains(user)))
        });
    let Some(elements) = erasable else {
        trace!("releasing {array} before {anchor}");
        func.insert_before(anchor, InstKind::Destroy { value: array }, loc.clone());
        return;
    };
    for link in &elements.chain {
        func.erase(*link);
    }
    trace!("erased array {array}");
    for value in elements.values {
        let nested = matches!(
            func.kind(value),
            InstKind::ArrayAlloc { .. } | InstKind::ArrayInsert { .. }
        );
        if nested && func.is_live(value) && func.users(value).is_empty() {
            remove_or_destroy_array_value(func, value, loc, anchor);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{device::DeviceType, ir::FunctionBuilder};

    const F32: ValueType = ValueType::Tensor(DataType::Float);

    fn cpu() -> DeviceConfiguration {
        DeviceConfiguration::new(DeviceType::Cpu, false).unwrap()
    }

    #[test]
    fn test_canonicalize_erases_unused_arrays() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(F32);
        let shape = b.int_array(&[4, 1]);
        let op = b.tensor_op("Reshape,$in,shape$shape", &[x, shape], F32);
        b.ret(&[op]);
        let mut f = b.finish();

        let desc = canonicalize(&mut f, op, &mut cpu()).unwrap().unwrap();
        assert_eq!(
            desc.mnemonic(),
            "Reshape,$in,shape$shape,$elt,$elt,__device"
        );
        assert!(desc.is_canonical());
        assert_eq!(desc.device(), Some(DeviceType::Cpu));
        assert!(!f.is_live(shape));
        assert!(!f.iter().any(|i| matches!(f.kind(i), InstKind::ArrayAlloc { .. } | InstKind::Destroy { .. })));
        f.verify().unwrap();
    }

    #[test]
    fn test_canonicalize_destroys_shared_arrays() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(F32);
        let shape = b.int_array(&[2]);
        let op = b.tensor_op("Reshape,$in,shape$shape", &[x, shape], F32);
        let other = b.builtin("use_array", &[shape], ValueType::Unit);
        b.ret(&[op]);
        let mut f = b.finish();

        canonicalize(&mut f, op, &mut cpu()).unwrap();
        assert!(f.is_live(shape));
        assert!(f.is_live(other));
        let destroys = f
            .iter()
            .filter(|i| f.kind(*i) == &InstKind::Destroy { value: shape })
            .collect_vec();
        assert_eq!(destroys.len(), 1);
        f.verify().unwrap();
    }

    #[test]
    fn test_canonicalize_nested_shape_arrays() {
        let mut b = FunctionBuilder::new("f");
        let s1 = b.int_array(&[2, 2]);
        let s2 = b.int_array(&[3]);
        let shapes = b.array(ValueType::Array(Box::new(ValueType::Scalar(DataType::Int64))), &[s1, s2]);
        let op = b.tensor_op("tfc.RecvFromHost,tensorId,__shapes$shapearray", &[s1, shapes], F32);
        b.ret(&[op]);
        let mut f = b.finish();

        // `s1` also feeds the op directly as a plain attribute, which is rejected.
        assert!(canonicalize(&mut f, op, &mut cpu()).is_err());

        let mut b = FunctionBuilder::new("g");
        let id = b.int(0, DataType::Int64);
        let s1 = b.int_array(&[2, 2]);
        let s2 = b.int_array(&[3]);
        let shapes = b.array(ValueType::Array(Box::new(ValueType::Scalar(DataType::Int64))), &[s1, s2]);
        let op = b.tensor_op("tfc.RecvFromHost,tensorId,__shapes$shapearray", &[id, shapes], F32);
        b.ret(&[op]);
        let mut g = b.finish();
        let desc = canonicalize(&mut g, op, &mut cpu()).unwrap().unwrap();
        assert_eq!(
            desc.mnemonic(),
            "tfc.RecvFromHost,tensorId,__shapes$shapearray,$shape,$elt,$elt,$shape,$elt,__device"
        );
        assert!(!g.is_live(shapes));
        assert!(!g.is_live(s1));
        assert!(!g.is_live(s2));
        g.verify().unwrap();
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(F32);
        let y = b.param(F32);
        let list = b.array(F32, &[x, y]);
        let gpu = b.string("/device:GPU:0");
        let op = b.tensor_op("AddN,$inlist,__device", &[list, gpu], F32);
        b.ret(&[op]);
        let mut f = b.finish();
        let mut config = cpu();

        let first = canonicalize(&mut f, op, &mut config).unwrap().unwrap();
        let len = f.len();
        let second = canonicalize(&mut f, op, &mut config).unwrap().unwrap();
        assert_eq!(first.mnemonic(), second.mnemonic());
        assert_eq!(second.device(), Some(DeviceType::Gpu));
        assert_eq!(f.len(), len);
        assert!(!f.is_live(gpu));
        assert_eq!(config.used_devices(), &[DeviceType::Cpu, DeviceType::Gpu]);
        f.verify().unwrap();
    }

    #[test]
    fn test_configuration_ops_are_not_placed() {
        let mut b = FunctionBuilder::new("f");
        let on = b.int(1, DataType::Int64);
        let cfg = b.tensor_op("tfc.configureGPU,enableInfeed", &[on], ValueType::Unit);
        b.ret(&[]);
        let mut f = b.finish();
        let before = f.clone();

        let mut config = cpu();
        assert!(canonicalize(&mut f, cfg, &mut config).unwrap().is_none());
        assert_eq!(f, before);
        assert_eq!(config.used_devices(), &[DeviceType::Cpu]);
    }

    #[test]
    fn test_op_builder_mnemonic() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(F32);
        let t = b.int(1, DataType::Int64);
        b.ret(&[]);
        let mut f = b.finish();
        let anchor = f.return_inst().unwrap();

        let mut builder = OpBuilder::new("Cast");
        builder.push("", OperandRole::Input, x);
        builder.push("DstT", OperandRole::DType, t);
        builder.append_device_attribute(&mut f, anchor, "/device:CPU:0");
        assert_eq!(builder.mnemonic(), "Cast,$in,DstT$dtype,__device");
        assert_eq!(builder.operands().len(), 3);
        let InstKind::Builtin { name, .. } = builder.build(F32) else {
            panic!("expected a builtin");
        };
        assert_eq!(name, "__tfop_Cast,$in,DstT$dtype,__device");
    }
}
