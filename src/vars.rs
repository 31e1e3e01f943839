//! Declared variables and user functions

use std::fmt;
use std::sync::Arc;

use crate::dtype::Dtype;
use crate::error::{CompileError, CompileResult, Pos};
use crate::value::Value;

/// A plain array variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub dtype: Dtype,
}

impl Variable {
    pub fn new(name: impl Into<String>, dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

type Callback = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A host function callable from expressions.
///
/// Arguments arrive cast to the declared parameter dtypes; the returned value is
/// cast to the declared return dtype.
#[derive(Clone)]
pub struct UserFunction {
    name: String,
    params: Vec<Dtype>,
    ret: Dtype,
    callback: Callback,
}

impl UserFunction {
    /// Wrap a plain function
    pub fn function(
        name: impl Into<String>,
        params: &[Dtype],
        ret: Dtype,
        f: fn(&[Value]) -> Value,
    ) -> Self {
        Self {
            name: name.into(),
            params: params.to_vec(),
            ret,
            callback: Arc::new(f),
        }
    }

    /// Wrap a closure that receives its captured context on every call
    pub fn closure<C, F>(name: impl Into<String>, params: &[Dtype], ret: Dtype, context: C, f: F) -> Self
    where
        C: Send + Sync + 'static,
        F: Fn(&C, &[Value]) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params: params.to_vec(),
            ret,
            callback: Arc::new(move |args: &[Value]| f(&context, args)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Dtype] {
        &self.params
    }

    pub fn ret(&self) -> Dtype {
        self.ret
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.callback)(args).cast(self.ret)
    }
}

impl fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("ret", &self.ret)
            .finish()
    }
}

/// Role of an extended variable
#[derive(Debug, Clone)]
pub enum VarKind {
    Array,
    /// Fixed-width UCS-4 strings, `itemsize` in bytes
    String { itemsize: usize },
    Function(UserFunction),
}

/// A variable with an explicit role
#[derive(Debug, Clone)]
pub struct VariableEx {
    pub name: String,
    pub dtype: Dtype,
    pub kind: VarKind,
}

impl VariableEx {
    pub fn array(name: impl Into<String>, dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            dtype,
            kind: VarKind::Array,
        }
    }

    pub fn string(name: impl Into<String>, itemsize: usize) -> Self {
        Self {
            name: name.into(),
            dtype: Dtype::String,
            kind: VarKind::String { itemsize },
        }
    }

    pub fn function(func: UserFunction) -> Self {
        Self {
            name: func.name.clone(),
            dtype: func.ret,
            kind: VarKind::Function(func),
        }
    }

    /// Whether the variable binds an input buffer
    pub fn is_input(&self) -> bool {
        !matches!(self.kind, VarKind::Function(_))
    }

    /// Characters per string element
    pub fn chars(&self) -> usize {
        match self.kind {
            VarKind::String { itemsize } => itemsize / 4,
            _ => 0,
        }
    }
}

impl From<Variable> for VariableEx {
    fn from(var: Variable) -> Self {
        VariableEx::array(var.name, var.dtype)
    }
}

impl From<&Variable> for VariableEx {
    fn from(var: &Variable) -> Self {
        VariableEx::array(var.name.clone(), var.dtype)
    }
}

const KEYWORDS: &[&str] = &[
    "def", "if", "elif", "else", "for", "in", "while", "break", "continue", "return", "and",
    "or", "not", "True", "False", "print", "range",
];

/// Names the language reserves for itself
pub fn is_reserved(name: &str) -> bool {
    if KEYWORDS.contains(&name)
        || matches!(name, "result" | "pi" | "e" | "_ndim" | "where" | "pow")
        || crate::reduction::ReductionKind::from_name(name).is_some()
        || crate::builtins::Builtin::lookup(name).is_some()
        || crate::builtins::cast_target(name).is_some()
        || matches!(name, "startswith" | "endswith" | "contains")
        || Dtype::from_name(name).is_some()
    {
        return true;
    }
    ["_i", "_n"].iter().any(|prefix| {
        name.strip_prefix(prefix)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Validate a declaration list: unique names, usable dtypes, sane string widths
pub fn validate(vars: &[VariableEx]) -> CompileResult<()> {
    for (i, var) in vars.iter().enumerate() {
        if var.name.is_empty() {
            return Err(CompileError::invalid_arg("variable names must not be empty"));
        }
        if vars[..i].iter().any(|other| other.name == var.name) {
            return Err(CompileError::invalid_arg(format!(
                "duplicate variable `{}`",
                var.name
            )));
        }
        match &var.kind {
            VarKind::Array => {
                if var.dtype == Dtype::String {
                    return Err(CompileError::invalid_arg(format!(
                        "variable `{}` has dtype string but no itemsize; declare it with VariableEx::string",
                        var.name
                    )));
                }
            }
            VarKind::String { itemsize } => {
                if *itemsize == 0 || itemsize % 4 != 0 {
                    return Err(CompileError::invalid_arg(format!(
                        "string variable `{}` has itemsize {}, expected a non-zero multiple of 4",
                        var.name, itemsize
                    )));
                }
            }
            VarKind::Function(func) => {
                let pos = Pos::default();
                if is_reserved(&func.name) {
                    return Err(CompileError::type_error(
                        pos,
                        format!("`{}` is reserved and cannot name a user function", func.name),
                    ));
                }
                if func.ret == Dtype::Auto || !func.ret.is_numeric() {
                    return Err(CompileError::type_error(
                        pos,
                        format!("user function `{}` needs an explicit numeric return dtype", func.name),
                    ));
                }
                if func.params.iter().any(|d| !d.is_numeric()) {
                    return Err(CompileError::type_error(
                        pos,
                        format!(
                            "user function `{}` needs explicit numeric parameter dtypes",
                            func.name
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}
