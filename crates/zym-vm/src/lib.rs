//! Register-based virtual machine for the Zym scripting language.
//!
//! Each call frame owns a window of registers on one contiguous value
//! stack. On top of that base the VM layers first-class references
//! (write-through aliases of locals, globals, upvalues and container
//! elements), closures with open/closed upvalues, one-shot delimited
//! continuations, and tail calls that reuse the caller's frame. Heap
//! values live in a [`zym_gc`] mark-and-sweep heap behind generation
//! checked handles, so a dangling handle fails to resolve instead of
//! aliasing whatever reused its slot.
//!
//! The host drives execution through [`Vm::run_script`] and the staged
//! call API ([`Vm::call_prepare`] / [`Vm::call_execute`]); both report a
//! final [`Outcome`]. Guest faults surface as [`RuntimeError`] values
//! with a stack trace; they never poison the VM itself.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;
use zym_bytecode::{mangle, ChunkBuilder, FuncProto, OpCode, Qualifier};
use zym_gc::{Handle, Heap, Trace, Tracer};

mod dispatch;
pub mod error;
pub mod host;
pub mod metrics;
mod refs;
mod value;

pub use error::{RuntimeError, TraceFrame, VmError};
pub use host::{HostValue, NativeOutcome, NativeRefHandler};
pub use metrics::VmMetrics;
pub use value::{MapKey, Value};

use host::NativeHandler;
use value::{display_value, type_name, NativeFn, Obj, UpvalueState};

/// Result of driving the VM until it stops.
#[derive(Debug)]
pub enum Outcome {
    /// The outermost frame returned; carries its return value.
    Done(HostValue),
    /// A preemption checkpoint fired while a yield was requested. Resume
    /// with [`Vm::resume_run`].
    Yield,
    /// Guest code faulted. The VM's frame stack has been unwound.
    Error(RuntimeError),
}

/// Tunables fixed at VM construction.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Hard cap on value-stack slots.
    pub stack_max: usize,
    /// Hard cap on call-frame depth.
    pub frames_max: usize,
    /// Allocations between garbage collections.
    pub gc_threshold: usize,
    /// Collect before every allocation. For tests.
    pub gc_stress: bool,
    /// Instructions between preemption checkpoints; 0 disables them.
    pub preempt_interval: u32,
    /// Update [`VmMetrics`] counters while running.
    pub collect_metrics: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_max: 1 << 16,
            frames_max: 1024,
            gc_threshold: 16 * 1024,
            gc_stress: false,
            preempt_interval: 1024,
            collect_metrics: false,
        }
    }
}

/// One activation record. `base` is the absolute stack index of the
/// frame's register zero.
pub(crate) struct CallFrame {
    pub proto: Rc<FuncProto>,
    /// Backing closure, if the function captured upvalues.
    pub closure: Option<Handle>,
    pub ip: usize,
    pub base: usize,
    /// Absolute slot the return value is written to; `None` at a
    /// capture or trampoline boundary where the value is redirected.
    pub return_slot: Option<usize>,
}

impl Trace for CallFrame {
    fn trace(&self, tracer: &mut dyn Tracer) {
        if let Some(closure) = self.closure {
            tracer.mark(closure);
        }
    }
}

/// An installed delimiter for CAPTURE/ABORT to target.
pub(crate) struct PromptEntry {
    pub tag: Handle,
    /// `frames.len()` when the prompt was pushed; the owner frame is
    /// `frames[frame_count - 1]`.
    pub frame_count: usize,
    /// Absolute stack slot where the capture region begins.
    pub stack_base: usize,
    /// Absolute slot that receives the continuation or abort value.
    pub result_slot: usize,
}

/// Return-redirection record pushed by RESUME: when the frame stack
/// shrinks back to `frame_boundary`, the returning value lands in
/// `return_slot` of the resumer instead of the captured caller.
pub(crate) struct ResumeEntry {
    pub frame_boundary: usize,
    pub return_slot: usize,
}

struct EnumInfo {
    name: String,
    variants: Vec<String>,
}

/// The virtual machine. Single-threaded; one guest computation at a time.
pub struct Vm {
    config: VmConfig,
    heap: Heap<Obj>,
    allocations_since_gc: usize,

    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// `None` marks a slot that is reserved (referenced) but not yet
    /// defined.
    globals: Vec<Option<Value>>,
    global_slots: HashMap<String, u32>,
    global_names: Vec<String>,

    /// Open upvalues, sorted by stack slot, highest first.
    open_upvalues: Vec<Handle>,
    pub(crate) prompts: Vec<PromptEntry>,
    pub(crate) resume_stack: Vec<ResumeEntry>,

    enums: Vec<EnumInfo>,

    /// Keeps freshly built values alive across allocations that could
    /// trigger a collection before the value is anchored anywhere.
    temp_roots: Vec<Value>,

    // Staged host call.
    staged_callee: Option<Value>,
    staged_args: Vec<Value>,
    last_result: Option<Value>,

    pub(crate) preempt_countdown: u32,
    preempt_requested: bool,

    pub(crate) metrics: VmMetrics,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let preempt_countdown = config.preempt_interval;
        Vm {
            config,
            heap: Heap::new(),
            allocations_since_gc: 0,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Vec::new(),
            global_slots: HashMap::new(),
            global_names: Vec::new(),
            open_upvalues: Vec::new(),
            prompts: Vec::new(),
            resume_stack: Vec::new(),
            enums: Vec::new(),
            temp_roots: Vec::new(),
            staged_callee: None,
            staged_args: Vec::new(),
            last_result: None,
            preempt_countdown,
            preempt_requested: false,
            metrics: VmMetrics::default(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn metrics(&self) -> &VmMetrics {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    /// Asks the VM to yield at its next preemption checkpoint. Safe to
    /// call from a native function.
    pub fn request_preempt(&mut self) {
        self.preempt_requested = true;
    }

    pub(crate) fn take_preempt_request(&mut self) -> bool {
        std::mem::take(&mut self.preempt_requested)
    }

    // ----- execution entry points -------------------------------------

    /// Runs a zero-arity script function to completion (or to a yield or
    /// fault). The VM must be idle.
    pub fn run_script(&mut self, proto: Rc<FuncProto>) -> Outcome {
        if !self.frames.is_empty() {
            return Outcome::Error(RuntimeError::msg("vm is already running"));
        }
        debug!(module = %proto.module, "running script");
        self.last_result = None;
        if let Err(err) = self.push_frame(proto, None, None) {
            return self.fault(err);
        }
        dispatch::run_loop(self)
    }

    /// Continues after an [`Outcome::Yield`].
    pub fn resume_run(&mut self) -> Outcome {
        if self.frames.is_empty() {
            return Outcome::Error(RuntimeError::msg("vm has nothing to resume"));
        }
        dispatch::run_loop(self)
    }

    /// True if the VM is suspended mid-run (after a yield).
    pub fn is_suspended(&self) -> bool {
        !self.frames.is_empty()
    }

    // ----- staged host-call API ---------------------------------------

    /// Stages a call to the global function `name` with `arity`
    /// arguments, looked up under its mangled `name@arity` binding first
    /// and the plain name second.
    pub fn call_prepare(&mut self, name: &str, arity: u8) -> Result<(), VmError> {
        if !self.frames.is_empty() {
            return Err(VmError::InvalidState("vm is already running"));
        }
        let mangled = mangle(name, arity);
        let callee = self
            .defined_global(&mangled)
            .or_else(|| self.defined_global(name))
            .ok_or_else(|| VmError::UnknownFunction(mangled))?;
        self.staged_callee = Some(callee);
        self.staged_args.clear();
        Ok(())
    }

    pub fn call_push_arg(&mut self, arg: HostValue) -> Result<(), VmError> {
        if self.staged_callee.is_none() {
            return Err(VmError::InvalidState("call_prepare was not called"));
        }
        let value = self.from_host(&arg)?;
        self.staged_args.push(value);
        Ok(())
    }

    /// Invokes the staged call through a one-instruction trampoline
    /// frame, so returns, tail calls and continuations inside the callee
    /// all terminate at the host boundary uniformly.
    pub fn call_execute(&mut self) -> Result<Outcome, VmError> {
        let callee = self
            .staged_callee
            .take()
            .ok_or(VmError::InvalidState("call_prepare was not called"))?;
        let args = std::mem::take(&mut self.staged_args);
        let argc = args.len() as u8;

        let proto = trampoline_proto(argc);
        self.last_result = None;
        let base = match self.push_frame(proto, None, None) {
            Ok(base) => base,
            Err(err) => return Ok(self.fault(err)),
        };
        self.stack[base] = callee;
        for (i, arg) in args.into_iter().enumerate() {
            self.stack[base + 1 + i] = arg;
        }
        match self.begin_call(callee, 0, argc, dispatch::CallStyle::Plain) {
            Ok(_) => Ok(dispatch::run_loop(self)),
            Err(err) => Ok(self.fault(err)),
        }
    }

    /// The value produced by the last completed run, if any.
    pub fn call_result(&self) -> Option<HostValue> {
        self.last_result.as_ref().map(|v| self.to_host(v))
    }

    // ----- globals and natives ----------------------------------------

    pub fn define_global(&mut self, name: &str, value: HostValue) -> Result<(), VmError> {
        let value = self.from_host(&value)?;
        let slot = self.ensure_global_slot(name);
        self.globals[slot as usize] = Some(value);
        Ok(())
    }

    pub fn global_value(&self, name: &str) -> Option<HostValue> {
        let value = self.defined_global(name)?;
        Some(self.to_host(&value))
    }

    /// Registers a native function under its mangled name and wires the
    /// plain name through an arity dispatcher when overloads accumulate.
    pub fn define_native<F>(&mut self, name: &str, arity: u8, handler: F)
    where
        F: Fn(&mut Vm, &[Value]) -> NativeOutcome + 'static,
    {
        self.define_native_qualified(name, arity, None, handler)
    }

    pub fn define_native_qualified<F>(
        &mut self,
        name: &str,
        arity: u8,
        qualifiers: Option<Box<[Qualifier]>>,
        handler: F,
    ) where
        F: Fn(&mut Vm, &[Value]) -> NativeOutcome + 'static,
    {
        let native = Obj::Native(NativeFn {
            name: name.to_string(),
            arity,
            qualifiers,
            handler: Rc::new(handler) as Rc<NativeHandler>,
        });
        let handle = self.alloc(native);
        self.define_callable(name, arity, Value::Obj(handle));
    }

    /// Installs `value` (a closure or native) under `name@arity` and
    /// keeps the plain-name binding callable across arities.
    pub(crate) fn define_callable(&mut self, name: &str, arity: u8, value: Value) {
        let mangled = mangle(name, arity);
        let slot = self.ensure_global_slot(&mangled);
        self.globals[slot as usize] = Some(value);

        let existing = self.defined_global(name);
        match existing {
            Some(Value::Obj(handle))
                if matches!(self.heap.get(handle), Some(Obj::Dispatcher { .. })) =>
            {
                if let Some(Obj::Dispatcher { overloads, .. }) = self.heap.get_mut(handle) {
                    overloads.insert(arity, value);
                }
            }
            Some(prev @ Value::Obj(_)) if self.callable_arity(&prev) != Some(arity) => {
                let prev_arity = self.callable_arity(&prev);
                let mut overloads = HashMap::new();
                if let Some(prev_arity) = prev_arity {
                    overloads.insert(prev_arity, prev);
                }
                overloads.insert(arity, value);
                let dispatcher = self.alloc(Obj::Dispatcher {
                    name: name.to_string(),
                    overloads,
                });
                let slot = self.ensure_global_slot(name);
                self.globals[slot as usize] = Some(Value::Obj(dispatcher));
            }
            _ => {
                let slot = self.ensure_global_slot(name);
                self.globals[slot as usize] = Some(value);
            }
        }
    }

    fn callable_arity(&self, value: &Value) -> Option<u8> {
        let Value::Obj(handle) = value else { return None };
        match self.heap.get(*handle)? {
            Obj::Closure { proto, .. } => Some(proto.arity),
            Obj::Native(native) => Some(native.arity),
            _ => None,
        }
    }

    /// Registers an enum type; variants are addressed by index in
    /// bytecode constants.
    pub fn register_enum(&mut self, name: &str, variants: &[&str]) -> u16 {
        let id = self.enums.len() as u16;
        self.enums.push(EnumInfo {
            name: name.to_string(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
        });
        id
    }

    pub(crate) fn enum_type_name(&self, type_id: u16) -> String {
        match self.enums.get(type_id as usize) {
            Some(info) => info.name.clone(),
            None => format!("enum#{type_id}"),
        }
    }

    fn enum_variant_name(&self, type_id: u16, variant: u16) -> String {
        self.enums
            .get(type_id as usize)
            .and_then(|info| info.variants.get(variant as usize))
            .cloned()
            .unwrap_or_else(|| format!("variant#{variant}"))
    }

    // ----- global slot table ------------------------------------------

    /// Resolves `name` to its slot, reserving a fresh (undefined) slot on
    /// first sight. Slots are append-only, so cached slot numbers stay
    /// valid for the life of the VM.
    pub(crate) fn ensure_global_slot(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.global_slots.get(name) {
            return slot;
        }
        let slot = self.globals.len() as u32;
        self.globals.push(None);
        self.global_slots.insert(name.to_string(), slot);
        self.global_names.push(name.to_string());
        slot
    }

    pub(crate) fn lookup_global_slot(&self, name: &str) -> Option<u32> {
        self.global_slots.get(name).copied()
    }

    pub(crate) fn global_slot_value(&self, slot: u32) -> Option<Value> {
        self.globals.get(slot as usize).copied().flatten()
    }

    pub(crate) fn set_global_slot(&mut self, slot: u32, value: Value) {
        self.globals[slot as usize] = Some(value);
    }

    pub(crate) fn global_slot_name(&self, slot: u32) -> &str {
        self.global_names
            .get(slot as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }

    fn defined_global(&self, name: &str) -> Option<Value> {
        self.global_slot_value(self.lookup_global_slot(name)?)
    }

    // ----- heap --------------------------------------------------------

    pub(crate) fn alloc(&mut self, obj: Obj) -> Handle {
        if self.config.gc_stress || self.allocations_since_gc >= self.config.gc_threshold {
            self.collect_garbage();
        }
        self.allocations_since_gc += 1;
        self.heap.alloc(obj)
    }

    pub(crate) fn heap(&self) -> &Heap<Obj> {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap<Obj> {
        &mut self.heap
    }

    pub fn alloc_str(&mut self, s: impl Into<String>) -> Value {
        Value::Obj(self.alloc(Obj::Str(s.into())))
    }

    pub fn make_list(&mut self, items: Vec<Value>) -> Value {
        let mark = self.temp_roots.len();
        self.temp_roots.extend(items.iter().copied());
        let handle = self.alloc(Obj::List(items));
        self.temp_roots.truncate(mark);
        Value::Obj(handle)
    }

    /// Wraps a host-backed storage location as a reference value; reads
    /// and writes through it are delegated to the handler.
    pub fn make_native_ref(&mut self, handler: Rc<dyn NativeRefHandler>) -> Value {
        Value::Obj(self.alloc(Obj::NativeRef(handler)))
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    pub fn collect_garbage(&mut self) {
        let roots = VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            prompts: &self.prompts,
            temp_roots: &self.temp_roots,
            staged_callee: &self.staged_callee,
            staged_args: &self.staged_args,
            last_result: &self.last_result,
        };
        self.heap.collect(&roots);
        self.allocations_since_gc = 0;
        if self.config.collect_metrics {
            self.metrics.gc_cycles += 1;
        }
        debug!(live = self.heap.live_objects(), "gc cycle");
    }

    // ----- frames and upvalues ----------------------------------------

    pub(crate) fn push_frame(
        &mut self,
        proto: Rc<FuncProto>,
        closure: Option<Handle>,
        return_slot: Option<usize>,
    ) -> Result<usize, RuntimeError> {
        if self.frames.len() >= self.config.frames_max {
            return Err(RuntimeError::msg("stack overflow: call depth exceeded"));
        }
        let base = self.stack.len();
        let top = base + proto.max_regs as usize;
        if top > self.config.stack_max {
            return Err(RuntimeError::msg("stack overflow: value stack exhausted"));
        }
        self.stack.resize(top, Value::Null);
        self.frames.push(CallFrame {
            proto,
            closure,
            ip: 0,
            base,
            return_slot,
        });
        if self.config.collect_metrics && self.frames.len() > self.metrics.frames_peak {
            self.metrics.frames_peak = self.frames.len();
        }
        Ok(base)
    }

    /// Finds or creates the open upvalue aliasing `slot`. The open list
    /// stays sorted by slot, highest first, so closing scans a prefix.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut insert_at = self.open_upvalues.len();
        for (i, &handle) in self.open_upvalues.iter().enumerate() {
            let open_slot = self.open_slot(handle);
            if open_slot == slot {
                return handle;
            }
            if open_slot < slot {
                insert_at = i;
                break;
            }
        }
        let handle = self.alloc(Obj::Upvalue(UpvalueState::Open(slot)));
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    fn open_slot(&self, handle: Handle) -> usize {
        match self.heap.get(handle) {
            Some(Obj::Upvalue(UpvalueState::Open(slot))) => *slot,
            _ => panic!("corrupted open upvalue list"),
        }
    }

    /// Closes every open upvalue at or above `from_slot`, then repairs
    /// heap references that aliased a closed slot so they point at the
    /// closed upvalue instead of a soon-to-be-recycled stack index.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        let mut closed: HashMap<usize, Handle> = HashMap::new();
        while let Some(&handle) = self.open_upvalues.first() {
            let slot = self.open_slot(handle);
            if slot < from_slot {
                break;
            }
            self.open_upvalues.remove(0);
            let value = self.stack[slot];
            if let Some(Obj::Upvalue(state)) = self.heap.get_mut(handle) {
                *state = UpvalueState::Closed(value);
            }
            closed.insert(slot, handle);
        }
        if closed.is_empty() {
            return;
        }
        self.heap.for_each_mut(|_, obj| {
            if let Obj::Reference(kind) = obj {
                if let value::RefKind::Local(slot) = *kind {
                    if let Some(&upvalue) = closed.get(&slot) {
                        *kind = value::RefKind::Upvalue(upvalue);
                    }
                }
            }
        });
    }

    /// Promotes every LOCAL reference reachable from `value` whose slot
    /// lies at or above `frame_base` to an upvalue reference, so the
    /// value survives the frame it is escaping from. Runs before the
    /// frame's upvalues are closed.
    pub(crate) fn protect_escaping_refs(&mut self, value: Value, frame_base: usize) {
        let Value::Obj(root) = value else { return };
        let mut work = vec![root];
        let mut seen = std::collections::HashSet::new();
        seen.insert(root);
        while let Some(handle) = work.pop() {
            let escaping = match self.heap.get(handle) {
                Some(Obj::Reference(value::RefKind::Local(slot))) if *slot >= frame_base => {
                    Some(*slot)
                }
                _ => None,
            };
            if let Some(slot) = escaping {
                let upvalue = self.capture_upvalue(slot);
                if let Some(Obj::Reference(kind)) = self.heap.get_mut(handle) {
                    *kind = value::RefKind::Upvalue(upvalue);
                }
                continue;
            }
            let mut children: Vec<Handle> = Vec::new();
            let mut push = |v: &Value, children: &mut Vec<Handle>| {
                if let Value::Obj(h) = v {
                    children.push(*h);
                }
            };
            match self.heap.get(handle) {
                Some(Obj::List(items)) => {
                    for item in items {
                        push(item, &mut children);
                    }
                }
                Some(Obj::Map(entries)) => {
                    for item in entries.values() {
                        push(item, &mut children);
                    }
                }
                Some(Obj::Struct { fields, .. }) => {
                    for field in fields {
                        push(field, &mut children);
                    }
                }
                Some(Obj::Upvalue(UpvalueState::Closed(inner))) => push(inner, &mut children),
                Some(Obj::Reference(value::RefKind::Index { container, index })) => {
                    push(container, &mut children);
                    push(index, &mut children);
                }
                Some(Obj::Reference(value::RefKind::Property { container, key })) => {
                    push(container, &mut children);
                    push(key, &mut children);
                }
                _ => {}
            }
            for child in children {
                if seen.insert(child) {
                    work.push(child);
                }
            }
        }
    }

    /// Freezes the stack region above `stack_base` for capture or abort:
    /// every LOCAL reference anywhere on the heap that targets the region
    /// is promoted to an upvalue, then all open upvalues in the region
    /// are closed. The region's slots can then move or die without
    /// leaving stale absolute indices behind.
    pub(crate) fn seal_region(&mut self, stack_base: usize) {
        let mut slots: Vec<usize> = Vec::new();
        self.heap.for_each_mut(|_, obj| {
            if let Obj::Reference(value::RefKind::Local(slot)) = obj {
                if *slot >= stack_base {
                    slots.push(*slot);
                }
            }
        });
        slots.sort_unstable();
        slots.dedup();
        for slot in slots {
            let _ = self.capture_upvalue(slot);
        }
        self.close_upvalues(stack_base);
    }

    // ----- faults ------------------------------------------------------

    /// Attaches a trace (if the error lacks one), unwinds all guest
    /// state, and packages the fault for the host.
    pub(crate) fn fault(&mut self, mut err: RuntimeError) -> Outcome {
        if err.trace.is_empty() {
            err.trace = self.capture_trace();
        }
        self.frames.clear();
        self.stack.clear();
        self.open_upvalues.clear();
        self.prompts.clear();
        self.resume_stack.clear();
        Outcome::Error(err)
    }

    pub(crate) fn capture_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| TraceFrame {
                function: frame.proto.name.clone(),
                module: frame.proto.module.clone(),
                line: frame.proto.chunk.line_at(frame.ip.saturating_sub(1)),
            })
            .collect()
    }

    // ----- value utilities ---------------------------------------------

    /// Kind name as reported by TYPEOF; references report as
    /// "reference", not as their referent.
    pub fn value_type_name(&self, value: &Value) -> &'static str {
        type_name(&self.heap, value)
    }

    pub fn display(&self, value: &Value) -> String {
        display_value(&self.heap, value)
    }

    pub fn str_value(&self, value: &Value) -> Option<&str> {
        if let Value::Obj(handle) = value {
            if let Some(Obj::Str(s)) = self.heap.get(*handle) {
                return Some(s);
            }
        }
        None
    }

    // ----- host conversions --------------------------------------------

    pub(crate) fn from_host(&mut self, value: &HostValue) -> Result<Value, VmError> {
        match value {
            HostValue::Null => Ok(Value::Null),
            HostValue::Bool(b) => Ok(Value::Bool(*b)),
            HostValue::Num(n) => Ok(Value::Num(*n)),
            HostValue::Str(s) => Ok(self.alloc_str(s.clone())),
            HostValue::List(items) => {
                let mark = self.temp_roots.len();
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    let v = self.from_host(item)?;
                    self.temp_roots.push(v);
                    values.push(v);
                }
                let handle = self.alloc(Obj::List(values));
                self.temp_roots.truncate(mark);
                Ok(Value::Obj(handle))
            }
            HostValue::Map(entries) => {
                let mark = self.temp_roots.len();
                let mut map = indexmap::IndexMap::new();
                for (key, val) in entries {
                    let key = self.host_map_key(key)?;
                    let val = self.from_host(val)?;
                    self.temp_roots.push(val);
                    map.insert(key, val);
                }
                let handle = self.alloc(Obj::Map(map));
                self.temp_roots.truncate(mark);
                Ok(Value::Obj(handle))
            }
            HostValue::Enum { type_name, variant } => {
                let (type_id, info) = self
                    .enums
                    .iter()
                    .enumerate()
                    .find(|(_, info)| &info.name == type_name)
                    .map(|(id, info)| (id as u16, info))
                    .ok_or_else(|| VmError::UnknownEnum(type_name.clone()))?;
                let variant_idx = info
                    .variants
                    .iter()
                    .position(|v| v == variant)
                    .ok_or_else(|| VmError::UnknownEnum(format!("{type_name}.{variant}")))?;
                Ok(Value::Enum {
                    type_id,
                    variant: variant_idx as u16,
                })
            }
            HostValue::Opaque(kind) => Err(VmError::HostConvert(kind)),
        }
    }

    fn host_map_key(&self, key: &HostValue) -> Result<MapKey, VmError> {
        match key {
            HostValue::Null => Ok(MapKey::Null),
            HostValue::Bool(b) => Ok(MapKey::Bool(*b)),
            HostValue::Num(n) => {
                MapKey::from_num(*n).map_err(|_| VmError::HostConvert("NaN map key"))
            }
            HostValue::Str(s) => Ok(MapKey::Str(s.clone())),
            _ => Err(VmError::HostConvert("unhashable map key")),
        }
    }

    pub(crate) fn to_host(&self, value: &Value) -> HostValue {
        let mut path = Vec::new();
        self.to_host_inner(value, &mut path)
    }

    fn to_host_inner(&self, value: &Value, path: &mut Vec<Handle>) -> HostValue {
        match value {
            Value::Null => HostValue::Null,
            Value::Bool(b) => HostValue::Bool(*b),
            Value::Num(n) => HostValue::Num(*n),
            Value::Enum { type_id, variant } => HostValue::Enum {
                type_name: self.enum_type_name(*type_id),
                variant: self.enum_variant_name(*type_id, *variant),
            },
            Value::Obj(handle) => {
                if path.contains(handle) {
                    return HostValue::Opaque("cycle");
                }
                match self.heap.get(*handle) {
                    Some(Obj::Str(s)) => HostValue::Str(s.clone()),
                    Some(Obj::List(items)) => {
                        path.push(*handle);
                        let out = items
                            .iter()
                            .map(|item| self.to_host_inner(item, path))
                            .collect();
                        path.pop();
                        HostValue::List(out)
                    }
                    Some(Obj::Map(entries)) => {
                        path.push(*handle);
                        let out = entries
                            .iter()
                            .map(|(key, val)| {
                                (self.host_key_out(key), self.to_host_inner(val, path))
                            })
                            .collect();
                        path.pop();
                        HostValue::Map(out)
                    }
                    Some(Obj::Struct { schema, fields }) => {
                        path.push(*handle);
                        let out = schema
                            .fields
                            .iter()
                            .zip(fields)
                            .map(|(name, val)| {
                                (
                                    HostValue::Str(name.clone()),
                                    self.to_host_inner(val, path),
                                )
                            })
                            .collect();
                        path.pop();
                        HostValue::Map(out)
                    }
                    _ => HostValue::Opaque(type_name(&self.heap, value)),
                }
            }
        }
    }

    fn host_key_out(&self, key: &MapKey) -> HostValue {
        match key {
            MapKey::Null => HostValue::Null,
            MapKey::Bool(b) => HostValue::Bool(*b),
            MapKey::NumBits(bits) => HostValue::Num(f64::from_bits(*bits)),
            MapKey::Str(s) => HostValue::Str(s.clone()),
            MapKey::Enum { type_id, variant } => HostValue::Enum {
                type_name: self.enum_type_name(*type_id),
                variant: self.enum_variant_name(*type_id, *variant),
            },
        }
    }
}

/// Root set handed to the collector: everything outside the heap that
/// can keep an object alive.
struct VmRoots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a [Option<Value>],
    open_upvalues: &'a [Handle],
    prompts: &'a [PromptEntry],
    temp_roots: &'a [Value],
    staged_callee: &'a Option<Value>,
    staged_args: &'a [Value],
    last_result: &'a Option<Value>,
}

impl Trace for VmRoots<'_> {
    fn trace(&self, tracer: &mut dyn Tracer) {
        for value in self.stack {
            value.trace(tracer);
        }
        for frame in self.frames {
            frame.trace(tracer);
        }
        for value in self.globals.iter().flatten() {
            value.trace(tracer);
        }
        for &handle in self.open_upvalues {
            tracer.mark(handle);
        }
        for prompt in self.prompts {
            tracer.mark(prompt.tag);
        }
        for value in self.temp_roots {
            value.trace(tracer);
        }
        if let Some(value) = self.staged_callee {
            value.trace(tracer);
        }
        for value in self.staged_args {
            value.trace(tracer);
        }
        if let Some(value) = self.last_result {
            value.trace(tracer);
        }
    }
}

/// One-instruction chunk the staged host-call API runs the callee under:
/// the callee's return value lands in register zero and the trailing RET
/// hands it to the host.
fn trampoline_proto(arg_count: u8) -> Rc<FuncProto> {
    let mut builder = ChunkBuilder::new();
    builder.emit(OpCode::Return, 0, 0, 0, 0);
    Rc::new(FuncProto {
        name: "<host-call>".to_string(),
        module: "<host>".to_string(),
        arity: 0,
        max_regs: arg_count.saturating_add(1).max(1),
        qualifiers: None,
        upvalues: Vec::new(),
        chunk: builder.finish(),
    })
}
