//! The host boundary: conversions between guest values and plain Rust
//! data, plus the traits native functions and native references
//! implement.

use crate::error::RuntimeError;
use crate::value::Value;
use crate::Vm;

/// A guest value lifted out of the VM for the embedder. Containers are
/// copied out by value; opaque objects (functions, references,
/// continuations) surface as [`HostValue::Opaque`] with their kind name.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<HostValue>),
    Map(Vec<(HostValue, HostValue)>),
    Enum { type_name: String, variant: String },
    Opaque(&'static str),
}

impl HostValue {
    pub fn as_num(&self) -> Option<f64> {
        match self {
            HostValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// What a native function hands back to the dispatch loop.
pub enum NativeOutcome {
    /// Plain result; written to the caller's destination register.
    Value(Value),
    /// A guest fault raised on the caller's behalf.
    Error(RuntimeError),
    /// The native re-entered the VM (pushed frames itself); the
    /// dispatch loop resumes whatever it set up.
    Control,
}

/// A native function body. Arguments arrive with parameter qualifiers
/// already applied.
pub type NativeHandler = dyn Fn(&mut Vm, &[Value]) -> NativeOutcome;

/// Backing store for a NATIVE_REFERENCE value. Reads and writes through
/// the reference are delegated here.
pub trait NativeRefHandler {
    fn read(&self, vm: &mut Vm) -> Result<Value, RuntimeError>;
    fn write(&self, vm: &mut Vm, value: Value) -> Result<(), RuntimeError>;
}
