use super::{DataType, Function, InstKind, Location, TFOP_PREFIX, ValueId, ValueType};

/// Appends instructions to a new function, stamping each with the current
/// location.
#[derive(Debug)]
pub struct FunctionBuilder {
    func: Function,
    loc: Location,
    num_params: usize,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            func: Function::new(name),
            loc: Location::unknown(),
            num_params: 0,
        }
    }

    /// Sets the location used for the following instructions.
    pub fn at(&mut self, loc: Location) -> &mut Self {
        self.loc = loc;
        self
    }

    pub fn push(&mut self, kind: InstKind) -> ValueId {
        self.func.append(kind, self.loc.clone())
    }

    pub fn param(&mut self, ty: ValueType) -> ValueId {
        let index = self.num_params;
        self.num_params += 1;
        self.push(InstKind::Param { index, ty })
    }

    pub fn int(&mut self, value: i64, dtype: DataType) -> ValueId {
        self.push(InstKind::IntLiteral { value, dtype })
    }

    pub fn float(&mut self, value: f64, dtype: DataType) -> ValueId {
        self.push(InstKind::FloatLiteral { value, dtype })
    }

    pub fn string(&mut self, value: impl Into<String>) -> ValueId {
        self.push(InstKind::StringLiteral(value.into()))
    }

    pub fn metatype(&mut self, ty: ValueType) -> ValueId {
        self.push(InstKind::Metatype(ty))
    }

    pub fn function_ref(&mut self, name: impl Into<String>) -> ValueId {
        self.push(InstKind::FunctionRef(name.into()))
    }

    /// Builds an array literal the way the host compiler does: an allocation
    /// followed by one insertion per element.
    pub fn array(&mut self, element: ValueType, elements: &[ValueId]) -> ValueId {
        let mut array = self.push(InstKind::ArrayAlloc {
            len: elements.len(),
            element,
        });
        for (index, element) in elements.iter().enumerate() {
            array = self.push(InstKind::ArrayInsert {
                array,
                index,
                element: *element,
            });
        }
        array
    }

    /// Integer array literal, as used for shapes.
    pub fn int_array(&mut self, values: &[i64]) -> ValueId {
        let elements: Vec<_> = values.iter().map(|v| self.int(*v, DataType::Int64)).collect();
        self.array(ValueType::Scalar(DataType::Int64), &elements)
    }

    /// Appends a tensor operation. `mnemonic` is the op name followed by its
    /// operand tokens, e.g. `Add,$in,$in`.
    pub fn tensor_op(&mut self, mnemonic: &str, operands: &[ValueId], result: ValueType) -> ValueId {
        self.builtin(&format!("{TFOP_PREFIX}{mnemonic}"), operands, result)
    }

    pub fn builtin(&mut self, name: &str, operands: &[ValueId], result: ValueType) -> ValueId {
        self.push(InstKind::Builtin {
            name: name.to_string(),
            operands: operands.to_vec(),
            result,
        })
    }

    pub fn ret(&mut self, values: &[ValueId]) -> ValueId {
        self.push(InstKind::Return {
            values: values.to_vec(),
        })
    }

    pub fn finish(self) -> Function {
        self.func
    }
}
