use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use zym_bytecode::{FuncProto, Qualifier, StructSchema};
use zym_gc::{Handle, Heap, Trace, Tracer};

use crate::error::RuntimeError;
use crate::host::{NativeHandler, NativeRefHandler};
use crate::{CallFrame, PromptEntry, ResumeEntry};

/// An unboxed guest value. Everything with identity or interior state
/// lives on the heap behind a [`Handle`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    /// A variant of a registered enum type. Carries no payload.
    Enum { type_id: u16, variant: u16 },
    Obj(Handle),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }
}

/// A heap-allocated object.
pub(crate) enum Obj {
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<MapKey, Value>),
    Struct {
        schema: Rc<StructSchema>,
        fields: Vec<Value>,
    },
    Closure {
        proto: Rc<FuncProto>,
        upvalues: Vec<Handle>,
    },
    Upvalue(UpvalueState),
    Reference(RefKind),
    Native(NativeFn),
    NativeRef(Rc<dyn NativeRefHandler>),
    /// Routes a call to one of several functions by argument count.
    Dispatcher {
        name: String,
        overloads: HashMap<u8, Value>,
    },
    /// A fresh identity per MAKE_PROMPT_TAG execution; equality is
    /// handle equality.
    PromptTag { name: String },
    /// `None` once the continuation has been resumed or aborted through.
    Continuation(Option<ContState>),
}

pub(crate) enum UpvalueState {
    /// Still aliases a live stack slot (absolute index).
    Open(usize),
    Closed(Value),
}

/// The target of a first-class reference.
#[derive(Clone)]
pub(crate) enum RefKind {
    /// Absolute stack slot. Dangles once the owning frame returns,
    /// unless promoted to an upvalue first.
    Local(usize),
    /// Slot in the global table; survives frame churn and rebinds.
    Global(u32),
    Upvalue(Handle),
    Index { container: Value, index: Value },
    Property { container: Value, key: Value },
}

/// A suspended slice of the machine, rebased so all frame bases, return
/// slots and prompt offsets are relative to the captured boundary.
pub(crate) struct ContState {
    pub frames: Vec<CallFrame>,
    pub stack: Vec<Value>,
    pub prompts: Vec<PromptEntry>,
    /// Resume boundaries that were themselves inside the captured
    /// region, rebased like the frames.
    pub resume_entries: Vec<ResumeEntry>,
    /// Where the resume value lands, relative to the captured stack.
    pub resume_slot: usize,
}

pub(crate) struct NativeFn {
    pub name: String,
    pub arity: u8,
    pub qualifiers: Option<Box<[Qualifier]>>,
    pub handler: Rc<NativeHandler>,
}

/// A hashable key for guest maps. Numbers are keyed by canonical bit
/// pattern (-0.0 folds into 0.0); strings are keyed by content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapKey {
    Null,
    Bool(bool),
    NumBits(u64),
    Str(String),
    Enum { type_id: u16, variant: u16 },
}

impl MapKey {
    pub(crate) fn from_num(n: f64) -> Result<MapKey, RuntimeError> {
        if n.is_nan() {
            return Err(RuntimeError::msg("cannot use NaN as a map key"));
        }
        let n = if n == 0.0 { 0.0 } else { n };
        Ok(MapKey::NumBits(n.to_bits()))
    }
}

impl Trace for Value {
    fn trace(&self, tracer: &mut dyn Tracer) {
        if let Value::Obj(handle) = self {
            tracer.mark(*handle);
        }
    }
}

impl Trace for RefKind {
    fn trace(&self, tracer: &mut dyn Tracer) {
        match self {
            RefKind::Local(_) | RefKind::Global(_) => {}
            RefKind::Upvalue(handle) => tracer.mark(*handle),
            RefKind::Index { container, index } => {
                container.trace(tracer);
                index.trace(tracer);
            }
            RefKind::Property { container, key } => {
                container.trace(tracer);
                key.trace(tracer);
            }
        }
    }
}

impl Trace for Obj {
    fn trace(&self, tracer: &mut dyn Tracer) {
        match self {
            Obj::Str(_) | Obj::PromptTag { .. } | Obj::NativeRef(_) | Obj::Native(_) => {}
            Obj::List(items) => {
                for item in items {
                    item.trace(tracer);
                }
            }
            Obj::Map(entries) => {
                for value in entries.values() {
                    value.trace(tracer);
                }
            }
            Obj::Struct { fields, .. } => {
                for field in fields {
                    field.trace(tracer);
                }
            }
            Obj::Closure { upvalues, .. } => {
                for upvalue in upvalues {
                    tracer.mark(*upvalue);
                }
            }
            Obj::Upvalue(state) => match state {
                UpvalueState::Open(_) => {}
                UpvalueState::Closed(value) => value.trace(tracer),
            },
            Obj::Reference(kind) => kind.trace(tracer),
            Obj::Dispatcher { overloads, .. } => {
                for value in overloads.values() {
                    value.trace(tracer);
                }
            }
            Obj::Continuation(state) => {
                if let Some(state) = state {
                    state.trace(tracer);
                }
            }
        }
    }
}

impl Trace for ContState {
    fn trace(&self, tracer: &mut dyn Tracer) {
        for frame in &self.frames {
            frame.trace(tracer);
        }
        for value in &self.stack {
            value.trace(tracer);
        }
        for prompt in &self.prompts {
            tracer.mark(prompt.tag);
        }
    }
}

/// The kind name reported by TYPEOF and used in error messages. A
/// reference reports as "reference", never as its referent's kind.
pub(crate) fn type_name(heap: &Heap<Obj>, value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Num(_) => "number",
        Value::Enum { .. } => "enum",
        Value::Obj(handle) => match heap.get(*handle) {
            Some(Obj::Str(_)) => "string",
            Some(Obj::List(_)) => "list",
            Some(Obj::Map(_)) => "map",
            Some(Obj::Struct { .. }) => "struct",
            Some(Obj::Closure { .. }) => "function",
            Some(Obj::Native(_)) => "native",
            Some(Obj::Upvalue(_)) => "upvalue",
            Some(Obj::Reference(_)) => "reference",
            Some(Obj::NativeRef(_)) => "reference",
            Some(Obj::Dispatcher { .. }) => "dispatcher",
            Some(Obj::PromptTag { .. }) => "prompt_tag",
            Some(Obj::Continuation(_)) => "continuation",
            None => "invalid",
        },
    }
}

/// Human-readable rendering for traces and the disassembly-adjacent
/// debug surface. Containers render shallowly.
pub(crate) fn display_value(heap: &Heap<Obj>, value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Num(n) => {
            if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{n}")
            }
        }
        Value::Enum { type_id, variant } => format!("<enum {type_id}:{variant}>"),
        Value::Obj(handle) => match heap.get(*handle) {
            Some(Obj::Str(s)) => s.clone(),
            Some(Obj::List(items)) => format!("<list[{}]>", items.len()),
            Some(Obj::Map(entries)) => format!("<map[{}]>", entries.len()),
            Some(Obj::Struct { schema, .. }) => format!("<struct {}>", schema.name),
            Some(Obj::Closure { proto, .. }) => format!("<fn {}>", proto.name),
            Some(Obj::Native(native)) => format!("<native {}>", native.name),
            Some(Obj::Upvalue(_)) => "<upvalue>".to_string(),
            Some(Obj::Reference(_)) => "<reference>".to_string(),
            Some(Obj::NativeRef(_)) => "<native reference>".to_string(),
            Some(Obj::Dispatcher { name, .. }) => format!("<dispatcher {name}>"),
            Some(Obj::PromptTag { name }) => format!("<prompt {name}>"),
            Some(Obj::Continuation(_)) => "<continuation>".to_string(),
            None => "<invalid>".to_string(),
        },
    }
}
