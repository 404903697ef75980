//! Decoding of tensor ops.
//!
//! A tensor op is a builtin whose name is `__tfop_` followed by a mnemonic of
//! the form `opName[,attrName[$roleSuffix]]*`. The mnemonic carries one token
//! per operand: inputs first, then attributes. [`OperationDescriptor::decode`]
//! pairs every token with its operand, checks that attribute operands are
//! constants of the right shape and unfolds array operands into a marker
//! followed by one entry per element.

use crate::{
    device::DeviceType,
    ir::{ArrayElements, ConstantValue, Function, InstId, InstKind, Location, ValueId, ValueType},
    ops::{DEVICE_ATTR, is_configuration},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::ops::Range;

pub use error::DecodeError;
pub use rewrite::{OpBuilder, canonicalize, remove_or_destroy_array_value};

mod error;
mod rewrite;

/// How an operand of a tensor op is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandRole {
    /// A tensor input.
    Input,
    /// A scalar input, only accepted by the scalar promotion pseudo-op.
    ScalarInput,
    /// Start of an input list. The operand is a type marker, so that empty
    /// lists can be represented, and the list elements follow as `InputElt`.
    InputList,
    InputElt,
    /// A plain constant attribute.
    Normal,
    /// An integer literal holding a data type code.
    DType,
    /// A scalar or an array of scalars, to be turned into a tensor.
    Tensor,
    /// An integer array describing a shape.
    Shape,
    /// Start of an array attribute; the elements follow as `ArrayElement`.
    Array,
    ArrayElement,
    /// Start of an array of shapes. The operand is the number of shapes, each
    /// then given as a `Shape` marker followed by its elements.
    ShapeArray,
}

impl OperandRole {
    const ALL: [OperandRole; 11] = [
        OperandRole::Input,
        OperandRole::ScalarInput,
        OperandRole::InputList,
        OperandRole::InputElt,
        OperandRole::Normal,
        OperandRole::DType,
        OperandRole::Tensor,
        OperandRole::Shape,
        OperandRole::Array,
        OperandRole::ArrayElement,
        OperandRole::ShapeArray,
    ];

    /// The suffix following `$` in a mnemonic token. Empty for `Normal`.
    pub fn suffix(self) -> &'static str {
        match self {
            OperandRole::Input => "in",
            OperandRole::ScalarInput => "scalar",
            OperandRole::InputList => "inlist",
            OperandRole::InputElt => "inelt",
            OperandRole::Normal => "",
            OperandRole::DType => "dtype",
            OperandRole::Tensor => "tensor",
            OperandRole::Shape => "shape",
            OperandRole::Array => "array",
            OperandRole::ArrayElement => "elt",
            OperandRole::ShapeArray => "shapearray",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.suffix() == suffix)
    }

    pub fn all() -> impl Iterator<Item = OperandRole> {
        Self::ALL.into_iter()
    }

    pub fn is_input(self) -> bool {
        matches!(
            self,
            OperandRole::Input
                | OperandRole::ScalarInput
                | OperandRole::InputList
                | OperandRole::InputElt
        )
    }
}

/// Splits a mnemonic token like `shape$shape` into its attribute name and role.
/// A token without suffix is a `Normal` attribute.
pub fn decode_attribute_name(token: &str) -> Option<(&str, OperandRole)> {
    match token.split_once('$') {
        Some((name, suffix)) => OperandRole::from_suffix(suffix).map(|role| (name, role)),
        None => Some((token, OperandRole::Normal)),
    }
}

pub fn encode_attribute_name(name: &str, role: OperandRole) -> String {
    match role {
        OperandRole::Normal => name.to_string(),
        role => format!("{name}${}", role.suffix()),
    }
}

/// Whether `func` has anything to lower: a tensor op other than a device
/// configuration, or a tensor among its parameters or results.
pub fn is_tensor_function(func: &Function) -> bool {
    fn holds_tensor(ty: &ValueType) -> bool {
        match ty {
            ValueType::Tensor(_) => true,
            ValueType::Array(element) => holds_tensor(element),
            _ => false,
        }
    }
    func.iter().any(|inst| match func.kind(inst) {
        InstKind::Param { ty, .. } => holds_tensor(ty),
        InstKind::Return { values } => values.iter().any(|v| holds_tensor(&func.result_type(*v))),
        kind => kind.tensor_op_name().is_some_and(|op| !is_configuration(op)),
    })
}

/// Where the value of a decoded operand comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum OperandSource {
    /// An operand of the instruction.
    Value(ValueId),
    /// Marker of an array unfolded by the decoder, not yet materialized as an
    /// instruction. Holds the element type of the array.
    Marker(ValueType),
    /// Shape count of an unfolded shape array, not yet materialized.
    Count(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedOperand {
    pub name: String,
    pub role: OperandRole,
    pub source: OperandSource,
}

impl DecodedOperand {
    pub fn value(&self) -> Option<ValueId> {
        match self.source {
            OperandSource::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// A marker or plain operand together with the elements belonging to it.
#[derive(Clone, Copy, Debug)]
pub struct OperandGroup<'a> {
    pub head: &'a DecodedOperand,
    pub elements: &'a [DecodedOperand],
}

/// Decoded view of one tensor op.
#[derive(Clone, Debug)]
pub struct OperationDescriptor {
    inst: InstId,
    op_name: String,
    operands: Vec<DecodedOperand>,
    groups: Vec<Range<usize>>,
    device: Option<DeviceType>,
    unfolded_arrays: Vec<ValueId>,
}

impl OperationDescriptor {
    /// Decodes `inst`. Returns `Ok(None)` when the instruction is not a tensor op.
    pub fn decode(func: &Function, inst: InstId) -> Result<Option<Self>, DecodeError> {
        let InstKind::Builtin { operands, .. } = func.kind(inst) else {
            return Ok(None);
        };
        let Some(mnemonic) = func.kind(inst).tensor_op_mnemonic() else {
            return Ok(None);
        };
        let loc = func.loc(inst);
        let mut tokens = mnemonic.split(',');
        let op_name = tokens.next().unwrap_or_default();
        if op_name.is_empty() {
            return Err(DecodeError::EmptyOpName {
                mnemonic: mnemonic.to_string(),
                loc: loc.clone(),
            });
        }
        let tokens = tokens
            .map(|token| {
                decode_attribute_name(token).ok_or_else(|| DecodeError::UnknownRoleSuffix {
                    token: token.to_string(),
                    suffix: token
                        .split_once('$')
                        .map(|(_, suffix)| suffix.to_string())
                        .unwrap_or_default(),
                    loc: loc.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if tokens.len() != operands.len() {
            return Err(DecodeError::OperandCountMismatch {
                op: op_name.to_string(),
                expected: tokens.len(),
                actual: operands.len(),
                loc: loc.clone(),
            });
        }

        let mut decoder = Decoder {
            func,
            op: op_name,
            loc,
            tokens: &tokens,
            operands,
            pos: 0,
            out: Vec::new(),
            groups: Vec::new(),
            unfolded: Vec::new(),
        };
        decoder.run()?;
        let Decoder {
            out,
            groups,
            unfolded,
            ..
        } = decoder;

        let mut descriptor = OperationDescriptor {
            inst,
            op_name: op_name.to_string(),
            operands: out,
            groups,
            device: None,
            unfolded_arrays: unfolded,
        };
        if let Some(device) = descriptor.string_attribute(func, DEVICE_ATTR) {
            let device_type =
                DeviceType::from_device_string(&device).ok_or_else(|| DecodeError::UnknownDevice {
                    op: op_name.to_string(),
                    device: device.clone(),
                    loc: loc.clone(),
                })?;
            descriptor.device = Some(device_type);
        } else if descriptor.attribute(DEVICE_ATTR).is_some() {
            return Err(DecodeError::RoleMismatch {
                op: op_name.to_string(),
                name: DEVICE_ATTR.to_string(),
                expected: "a device string literal",
                loc: loc.clone(),
            });
        }
        Ok(Some(descriptor))
    }

    pub fn inst(&self) -> InstId {
        self.inst
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    pub fn operands(&self) -> &[DecodedOperand] {
        &self.operands
    }

    /// The device from the op's device attribute, if it has one.
    pub fn device(&self) -> Option<DeviceType> {
        self.device
    }

    /// Arrays that were unfolded into their elements while decoding.
    pub fn unfolded_arrays(&self) -> &[ValueId] {
        &self.unfolded_arrays
    }

    /// True when the operands already are in unfolded form, i.e. decoding did
    /// not need to look through any array.
    pub fn is_canonical(&self) -> bool {
        self.unfolded_arrays.is_empty()
    }

    pub fn groups(&self) -> Vec<OperandGroup<'_>> {
        self.groups
            .iter()
            .map(|range| OperandGroup {
                head: &self.operands[range.start],
                elements: &self.operands[range.start + 1..range.end],
            })
            .collect()
    }

    /// Values feeding the op as data: inputs and input list elements.
    pub fn inputs(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.operands
            .iter()
            .filter(|o| {
                matches!(
                    o.role,
                    OperandRole::Input | OperandRole::ScalarInput | OperandRole::InputElt
                )
            })
            .filter_map(DecodedOperand::value)
    }

    /// First attribute named `name`.
    pub fn attribute(&self, name: &str) -> Option<&DecodedOperand> {
        self.operands
            .iter()
            .find(|o| !o.role.is_input() && o.name == name)
    }

    pub fn int_attribute(&self, func: &Function, name: &str) -> Option<i64> {
        let value = self.attribute(name)?.value()?;
        func.constant_value(value)?.as_int()
    }

    pub fn string_attribute(&self, func: &Function, name: &str) -> Option<String> {
        let value = self.attribute(name)?.value()?;
        func.constant_value(value)?.as_str().map(str::to_string)
    }

    /// The mnemonic encoding the decoded operand list.
    pub fn mnemonic(&self) -> String {
        std::iter::once(self.op_name.clone())
            .chain(
                self.operands
                    .iter()
                    .map(|o| encode_attribute_name(&o.name, o.role)),
            )
            .join(",")
    }
}

struct Decoder<'a> {
    func: &'a Function,
    op: &'a str,
    loc: &'a Location,
    tokens: &'a [(&'a str, OperandRole)],
    operands: &'a [ValueId],
    pos: usize,
    out: Vec<DecodedOperand>,
    groups: Vec<Range<usize>>,
    unfolded: Vec<ValueId>,
}

impl<'a> Decoder<'a> {
    fn run(&mut self) -> Result<(), DecodeError> {
        let mut seen_attribute = false;
        while self.pos < self.tokens.len() {
            let (name, role) = self.tokens[self.pos];
            let value = self.operands[self.pos];
            if role.is_input() && seen_attribute {
                return Err(DecodeError::InputAfterAttribute {
                    op: self.op.to_string(),
                    position: self.pos,
                    loc: self.loc.clone(),
                });
            }
            seen_attribute |= !role.is_input();
            let start = self.out.len();
            self.pos += 1;
            match role {
                OperandRole::Input => {
                    self.expect_type(name, value, ValueType::is_tensor, "a tensor value")?;
                    self.push(name, role, value);
                }
                OperandRole::ScalarInput => {
                    self.expect_type(name, value, ValueType::is_scalar, "a scalar value")?;
                    self.push(name, role, value);
                }
                OperandRole::InputList => self.input_list(name, value)?,
                OperandRole::Normal => match self.func.constant_value(value) {
                    Some(c) if !c.is_array() => self.push(name, role, value),
                    Some(_) => return Err(self.mismatch(name, "a scalar constant")),
                    None => return Err(self.non_constant(name, "a constant")),
                },
                OperandRole::DType => match self.func.kind(value) {
                    InstKind::IntLiteral { .. } => self.push(name, role, value),
                    _ => return Err(self.non_constant(name, "a constant integer literal")),
                },
                OperandRole::Tensor => self.attribute_array(
                    name,
                    value,
                    role,
                    ConstantValue::is_numeric,
                    true,
                    "a constant tensor literal",
                )?,
                OperandRole::Shape => self.attribute_array(
                    name,
                    value,
                    role,
                    |c| c.as_int().is_some(),
                    false,
                    "a constant integer array",
                )?,
                OperandRole::Array => self.attribute_array(
                    name,
                    value,
                    role,
                    |c| !c.is_array(),
                    false,
                    "a constant array",
                )?,
                OperandRole::ShapeArray => self.shape_array(name, value)?,
                OperandRole::InputElt | OperandRole::ArrayElement => {
                    return Err(DecodeError::ElementWithoutMarker {
                        op: self.op.to_string(),
                        position: self.pos - 1,
                        loc: self.loc.clone(),
                    });
                }
            }
            self.groups.push(start..self.out.len());
        }
        Ok(())
    }

    fn push(&mut self, name: &str, role: OperandRole, value: ValueId) {
        self.push_source(name, role, OperandSource::Value(value));
    }

    fn push_source(&mut self, name: &str, role: OperandRole, source: OperandSource) {
        self.out.push(DecodedOperand {
            name: name.to_string(),
            role,
            source,
        });
    }

    fn is_marker(&self, value: ValueId) -> bool {
        matches!(self.func.kind(value), InstKind::Metatype(_))
    }

    /// Consumes the run of tokens with role `role` following the current one.
    fn take_elements(&mut self, role: OperandRole) -> Vec<(&'a str, ValueId)> {
        let mut elements = Vec::new();
        while self.pos < self.tokens.len() && self.tokens[self.pos].1 == role {
            elements.push((self.tokens[self.pos].0, self.operands[self.pos]));
            self.pos += 1;
        }
        elements
    }

    fn unfold(
        &mut self,
        name: &str,
        head: OperandRole,
        element: OperandRole,
        array: ValueId,
        elements: ArrayElements,
    ) {
        self.push_source(name, head, OperandSource::Marker(elements.element));
        for value in elements.values {
            self.push("", element, value);
        }
        self.unfolded.push(array);
    }

    fn input_list(&mut self, name: &str, value: ValueId) -> Result<(), DecodeError> {
        if self.is_marker(value) {
            self.push(name, OperandRole::InputList, value);
            for (elt_name, elt) in self.take_elements(OperandRole::InputElt) {
                self.expect_type(elt_name, elt, ValueType::is_tensor, "a tensor value")?;
                self.push(elt_name, OperandRole::InputElt, elt);
            }
            return Ok(());
        }
        if !matches!(self.func.result_type(value), ValueType::Array(_)) {
            return Err(self.mismatch(name, "a list of tensors"));
        }
        let elements = self.func.array_elements(value).ok_or_else(|| self.untraceable(name))?;
        for elt in &elements.values {
            self.expect_type(name, *elt, ValueType::is_tensor, "a list of tensors")?;
        }
        self.unfold(name, OperandRole::InputList, OperandRole::InputElt, value, elements);
        Ok(())
    }

    /// Tensor, shape and array attributes: either an already unfolded marker
    /// with its elements, an array literal to unfold, or (for tensors only) a
    /// single scalar.
    fn attribute_array(
        &mut self,
        name: &str,
        value: ValueId,
        role: OperandRole,
        valid_element: fn(&ConstantValue) -> bool,
        allow_scalar: bool,
        expected: &'static str,
    ) -> Result<(), DecodeError> {
        if self.is_marker(value) {
            self.push(name, role, value);
            for (elt_name, elt) in self.take_elements(OperandRole::ArrayElement) {
                match self.func.constant_value(elt) {
                    Some(c) if valid_element(&c) => self.push(elt_name, OperandRole::ArrayElement, elt),
                    _ => return Err(self.non_constant(name, expected)),
                }
            }
            return Ok(());
        }
        match self.func.constant_value(value) {
            Some(ConstantValue::Array { elements, .. }) if elements.iter().all(valid_element) => {
                let array = self.func.array_elements(value).ok_or_else(|| self.untraceable(name))?;
                self.unfold(name, role, OperandRole::ArrayElement, value, array);
                Ok(())
            }
            Some(c) if allow_scalar && valid_element(&c) => {
                self.push(name, role, value);
                Ok(())
            }
            None if matches!(self.func.result_type(value), ValueType::Array(_))
                && self.func.array_elements(value).is_none() =>
            {
                Err(self.untraceable(name))
            }
            _ => Err(self.non_constant(name, expected)),
        }
    }

    fn shape_array(&mut self, name: &str, value: ValueId) -> Result<(), DecodeError> {
        const EXPECTED: &str = "a constant array of shapes";
        if let InstKind::IntLiteral { value: count, .. } = self.func.kind(value) {
            let count = usize::try_from(*count).map_err(|_| self.non_constant(name, EXPECTED))?;
            self.push(name, OperandRole::ShapeArray, value);
            for found in 0..count {
                let is_shape_marker = self.pos < self.tokens.len()
                    && self.tokens[self.pos].1 == OperandRole::Shape
                    && self.is_marker(self.operands[self.pos]);
                if !is_shape_marker {
                    return Err(DecodeError::MissingElements {
                        op: self.op.to_string(),
                        name: name.to_string(),
                        expected: count,
                        actual: found,
                        loc: self.loc.clone(),
                    });
                }
                let (shape_name, marker) = (self.tokens[self.pos].0, self.operands[self.pos]);
                self.pos += 1;
                self.attribute_array(
                    shape_name,
                    marker,
                    OperandRole::Shape,
                    |c| c.as_int().is_some(),
                    false,
                    EXPECTED,
                )?;
            }
            return Ok(());
        }

        let shapes = match self.func.constant_value(value) {
            Some(ConstantValue::Array { elements, .. })
                if elements.iter().all(|shape| match shape {
                    ConstantValue::Array { elements, .. } => elements.iter().all(|d| d.as_int().is_some()),
                    _ => false,
                }) =>
            {
                self.func.array_elements(value).ok_or_else(|| self.untraceable(name))?
            }
            _ => return Err(self.non_constant(name, EXPECTED)),
        };
        self.push_source(name, OperandRole::ShapeArray, OperandSource::Count(shapes.values.len()));
        for shape in &shapes.values {
            let dims = self.func.array_elements(*shape).ok_or_else(|| self.untraceable(name))?;
            self.push_source("", OperandRole::Shape, OperandSource::Marker(dims.element));
            for dim in dims.values {
                self.push("", OperandRole::ArrayElement, dim);
            }
        }
        self.unfolded.push(value);
        Ok(())
    }

    fn expect_type(
        &self,
        name: &str,
        value: ValueId,
        check: fn(&ValueType) -> bool,
        expected: &'static str,
    ) -> Result<(), DecodeError> {
        if check(&self.func.result_type(value)) {
            Ok(())
        } else {
            Err(self.mismatch(name, expected))
        }
    }

    fn non_constant(&self, name: &str, expected: &'static str) -> DecodeError {
        DecodeError::NonConstantAttribute {
            op: self.op.to_string(),
            name: name.to_string(),
            expected,
            loc: self.loc.clone(),
        }
    }

    fn mismatch(&self, name: &str, expected: &'static str) -> DecodeError {
        DecodeError::RoleMismatch {
            op: self.op.to_string(),
            name: name.to_string(),
            expected,
            loc: self.loc.clone(),
        }
    }

    fn untraceable(&self, name: &str) -> DecodeError {
        DecodeError::UntraceableArray {
            op: self.op.to_string(),
            name: name.to_string(),
            loc: self.loc.clone(),
        }
    }
}
