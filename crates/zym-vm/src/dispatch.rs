//! The interpreter loop: instruction dispatch, the call/return protocol
//! (including frame-reusing tail calls), and delimited-continuation
//! capture, abort and resume.

use std::rc::Rc;

use tracing::trace;
use zym_bytecode::{
    decode_a, decode_b, decode_bx, decode_c, decode_op, decode_sbx, Constant, FuncProto, OpCode,
    Qualifier, QualifierSig,
};
use zym_gc::Handle;

use crate::error::RuntimeError;
use crate::host::{NativeHandler, NativeOutcome};
use crate::value::{ContState, Obj, RefKind, Value};
use crate::{Outcome, PromptEntry, ResumeEntry, Vm};

/// Depth bound for recursive value cloning; cyclic data trips it.
const MAX_CLONE_DEPTH: usize = 64;

/// How a call instruction transfers control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallStyle {
    /// Push a fresh frame.
    Plain,
    /// Reuse the caller's frame; the compiler has already closed the
    /// frame's upvalues.
    Tail,
    /// Reuse the frame only if the callee captures no upvalues,
    /// otherwise fall back to a plain push.
    Smart,
}

enum Flow {
    Continue,
    Done(Value),
    Yield,
}

enum Resolved {
    Closure {
        handle: Handle,
        proto: Rc<FuncProto>,
    },
    Native {
        handler: Rc<NativeHandler>,
        qualifiers: Option<Box<[Qualifier]>>,
    },
}

pub(crate) fn run_loop(vm: &mut Vm) -> Outcome {
    loop {
        match step(vm) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Done(value)) => {
                vm.last_result = Some(value);
                let host = vm.to_host(&value);
                return Outcome::Done(host);
            }
            Ok(Flow::Yield) => {
                if vm.config.collect_metrics {
                    vm.metrics.yields += 1;
                }
                return Outcome::Yield;
            }
            Err(err) => return vm.fault(err),
        }
    }
}

/// Executes one instruction.
fn step(vm: &mut Vm) -> Result<Flow, RuntimeError> {
    // Preemption checkpoint.
    if vm.config.preempt_interval != 0 {
        if vm.preempt_countdown <= 1 {
            vm.preempt_countdown = vm.config.preempt_interval;
            if vm.take_preempt_request() {
                return Ok(Flow::Yield);
            }
        } else {
            vm.preempt_countdown -= 1;
        }
    }

    let (proto, base, ip) = match vm.frames.last() {
        Some(frame) => (Rc::clone(&frame.proto), frame.base, frame.ip),
        None => return Ok(Flow::Done(Value::Null)),
    };
    let code = &proto.chunk.code;
    if ip >= code.len() {
        // Fall off the end: implicit null return.
        return Ok(match vm.do_return(Value::Null) {
            Some(value) => Flow::Done(value),
            None => Flow::Continue,
        });
    }
    let word = code[ip];
    let op = decode_op(word).unwrap_or_else(|| {
        panic!(
            "corrupted chunk: invalid opcode {:#04x} at offset {ip} in {}",
            word & 0xFF,
            proto.name
        )
    });
    vm.top_frame_mut().ip = ip + 1;
    if vm.config.collect_metrics {
        vm.metrics.instructions += 1;
    }

    let a = decode_a(word);
    let b = decode_b(word);
    let c = decode_c(word);

    match op {
        OpCode::LoadConst => {
            let value = vm.load_constant(&proto, decode_bx(word))?;
            vm.set_reg(base, a, value);
        }
        OpCode::LoadNum => {
            let lo = code[ip + 1] as u64;
            let hi = code[ip + 2] as u64;
            vm.top_frame_mut().ip = ip + 3;
            vm.set_reg(base, a, Value::Num(f64::from_bits(lo | (hi << 32))));
        }
        OpCode::LoadInt => {
            vm.set_reg(base, a, Value::Num(decode_bx(word) as f64));
        }
        OpCode::LoadNull => vm.set_reg(base, a, Value::Null),
        OpCode::LoadTrue => vm.set_reg(base, a, Value::Bool(true)),
        OpCode::LoadFalse => vm.set_reg(base, a, Value::Bool(false)),
        OpCode::Move => {
            let value = vm.reg(base, b);
            vm.set_reg(base, a, value);
        }

        OpCode::DefineGlobal => {
            let name = const_str(&proto, decode_bx(word))?;
            let slot = vm.ensure_global_slot(name);
            proto.chunk.cache_global_slot(ip, slot);
            let value = vm.reg(base, a);
            vm.set_global_slot(slot, value);
        }
        OpCode::GetGlobal => {
            let slot = vm.resolve_global(&proto, ip, decode_bx(word))?;
            let value = vm.global_slot_value(slot).ok_or_else(|| {
                RuntimeError::msg(format!(
                    "undefined variable '{}'",
                    vm.global_slot_name(slot)
                ))
            })?;
            vm.set_reg(base, a, value);
        }
        OpCode::SetGlobal => {
            let slot = vm.resolve_global(&proto, ip, decode_bx(word))?;
            let value = vm.reg(base, a);
            match vm.global_slot_value(slot) {
                Some(current) if vm.is_reference(&current) => {
                    let alias = matches!(
                        vm.reference_kind_of(&current),
                        Some(RefKind::Global(_))
                    );
                    if alias && vm.is_reference(&value) {
                        // Rebinding a global alias replaces the alias.
                        vm.set_global_slot(slot, value);
                    } else {
                        vm.write_reference(current, value, true)?;
                    }
                }
                Some(_) => vm.set_global_slot(slot, value),
                None => {
                    return Err(RuntimeError::msg(format!(
                        "undefined variable '{}'",
                        vm.global_slot_name(slot)
                    )))
                }
            }
        }

        OpCode::GetUpvalue => {
            let handle = vm.closure_upvalue(b)?;
            let value = vm.read_location(&RefKind::Upvalue(handle))?;
            vm.set_reg(base, a, value);
        }
        OpCode::SetUpvalue => {
            let handle = vm.closure_upvalue(b)?;
            let value = vm.reg(base, a);
            let current = vm.read_location(&RefKind::Upvalue(handle))?;
            if vm.is_reference(&current) {
                vm.write_reference(current, value, true)?;
            } else {
                vm.upvalue_set(handle, value)?;
            }
        }
        OpCode::CloseUpvalues => {
            vm.close_upvalues(base + a as usize);
        }
        OpCode::CloseFrameUpvalues => {
            vm.close_upvalues(base);
        }

        OpCode::MakeList => {
            let first = base + b as usize;
            let items: Vec<Value> = vm.stack[first..first + c as usize].to_vec();
            let handle = vm.alloc(Obj::List(items));
            vm.set_reg(base, a, Value::Obj(handle));
        }
        OpCode::MakeMap => {
            let mut map = indexmap::IndexMap::with_capacity(c as usize);
            let first = base + b as usize;
            for i in 0..c as usize {
                let key = vm.stack[first + 2 * i];
                let key = vm.deref_value(key)?;
                let key = vm.map_key(&key)?;
                let value = vm.stack[first + 2 * i + 1];
                map.insert(key, value);
            }
            let handle = vm.alloc(Obj::Map(map));
            vm.set_reg(base, a, Value::Obj(handle));
        }
        OpCode::MakeStruct => {
            let schema = match proto.chunk.constants.get(decode_bx(word) as usize) {
                Some(Constant::Schema(schema)) => Rc::clone(schema),
                _ => return Err(RuntimeError::msg("constant is not a struct schema")),
            };
            let first = base + a as usize + 1;
            let fields: Vec<Value> = vm.stack[first..first + schema.fields.len()].to_vec();
            let handle = vm.alloc(Obj::Struct { schema, fields });
            vm.set_reg(base, a, Value::Obj(handle));
        }
        OpCode::GetIndex => {
            let container = vm.deref_reg(base, b)?;
            let index = vm.deref_reg(base, c)?;
            let value = vm.index_get_raw(&container, &index)?;
            vm.set_reg(base, a, value);
        }
        OpCode::SetIndex => {
            let container = vm.deref_reg(base, a)?;
            let index = vm.deref_reg(base, b)?;
            let value = vm.reg(base, c);
            // A fresh map key has no current value; only an existing
            // reference element diverts the write through itself.
            match vm.index_get_raw(&container, &index) {
                Ok(current) if vm.is_reference(&current) => {
                    vm.write_reference(current, value, true)?;
                }
                _ => vm.index_set_raw(&container, &index, value)?,
            }
        }
        OpCode::GetField => {
            let container = vm.deref_reg(base, b)?;
            let key = vm.deref_reg(base, c)?;
            let value = vm.prop_get_raw(&container, &key)?;
            vm.set_reg(base, a, value);
        }
        OpCode::SetField => {
            let container = vm.deref_reg(base, a)?;
            let key = vm.deref_reg(base, b)?;
            let value = vm.reg(base, c);
            let current = vm.prop_get_raw(&container, &key);
            match current {
                Ok(current) if vm.is_reference(&current) => {
                    vm.write_reference(current, value, true)?;
                }
                _ => vm.prop_set_raw(&container, &key, value)?,
            }
        }

        OpCode::Add => {
            let x = vm.deref_reg(base, b)?;
            let y = vm.deref_reg(base, c)?;
            let value = match (&x, &y) {
                (Value::Num(x), Value::Num(y)) => Value::Num(x + y),
                _ => match (vm.str_value(&x), vm.str_value(&y)) {
                    (Some(xs), Some(ys)) => {
                        let joined = format!("{xs}{ys}");
                        vm.alloc_str(joined)
                    }
                    _ => {
                        return Err(RuntimeError::msg(format!(
                            "cannot add '{}' and '{}'",
                            vm.value_type_name(&x),
                            vm.value_type_name(&y)
                        )))
                    }
                },
            };
            vm.set_reg(base, a, value);
        }
        OpCode::Sub => vm.num_binop(base, a, b, c, "subtract", |x, y| Ok(x - y))?,
        OpCode::Mul => vm.num_binop(base, a, b, c, "multiply", |x, y| Ok(x * y))?,
        OpCode::Div => vm.num_binop(base, a, b, c, "divide", |x, y| {
            if y == 0.0 {
                Err(RuntimeError::msg("division by zero"))
            } else {
                Ok(x / y)
            }
        })?,
        OpCode::Mod => vm.num_binop(base, a, b, c, "take the remainder of", |x, y| {
            if y == 0.0 {
                Err(RuntimeError::msg("division by zero"))
            } else {
                Ok(x % y)
            }
        })?,
        OpCode::Negate => {
            let x = vm.deref_reg(base, b)?;
            let Value::Num(n) = x else {
                return Err(RuntimeError::msg(format!(
                    "cannot negate a value of type '{}'",
                    vm.value_type_name(&x)
                )));
            };
            vm.set_reg(base, a, Value::Num(-n));
        }
        OpCode::Not => {
            let x = vm.deref_reg(base, b)?;
            vm.set_reg(base, a, Value::Bool(!x.is_truthy()));
        }
        OpCode::Equal => {
            let eq = vm.values_equal(base, b, c)?;
            vm.set_reg(base, a, Value::Bool(eq));
        }
        OpCode::NotEqual => {
            let eq = vm.values_equal(base, b, c)?;
            vm.set_reg(base, a, Value::Bool(!eq));
        }
        OpCode::Less => vm.cmp_binop(base, a, b, c, |x, y| x < y)?,
        OpCode::LessEqual => vm.cmp_binop(base, a, b, c, |x, y| x <= y)?,
        OpCode::Greater => vm.cmp_binop(base, a, b, c, |x, y| x > y)?,
        OpCode::GreaterEqual => vm.cmp_binop(base, a, b, c, |x, y| x >= y)?,
        OpCode::BitAnd => vm.int_binop(base, a, b, c, |x, y| x & y)?,
        OpCode::BitOr => vm.int_binop(base, a, b, c, |x, y| x | y)?,
        OpCode::BitXor => vm.int_binop(base, a, b, c, |x, y| x ^ y)?,
        OpCode::BitNot => {
            let x = vm.deref_num(base, b, "apply bitwise not to")?;
            vm.set_reg(base, a, Value::Num(!to_int32(x) as f64));
        }
        OpCode::Shl => {
            vm.int_binop(base, a, b, c, |x, y| x.wrapping_shl(y as u32 & 31))?;
        }
        OpCode::Shr => {
            vm.int_binop(base, a, b, c, |x, y| x.wrapping_shr(y as u32 & 31))?;
        }
        OpCode::Ushr => {
            let x = vm.deref_num(base, b, "shift")?;
            let y = vm.deref_num(base, c, "shift")?;
            let shifted = to_uint32(x) >> (to_uint32(y) & 31);
            vm.set_reg(base, a, Value::Num(shifted as f64));
        }

        OpCode::Jump => {
            let target = (ip as i64 + 1 + decode_sbx(word) as i64) as usize;
            vm.top_frame_mut().ip = target;
        }
        OpCode::JumpLong => {
            let delta = code[ip + 1] as i32;
            let target = (ip as i64 + 2 + delta as i64) as usize;
            vm.top_frame_mut().ip = target;
        }
        OpCode::JumpIfFalse => {
            let cond = vm.deref_reg(base, a)?;
            if !cond.is_truthy() {
                let target = (ip as i64 + 1 + decode_sbx(word) as i64) as usize;
                vm.top_frame_mut().ip = target;
            }
        }
        OpCode::JumpIfTrue => {
            let cond = vm.deref_reg(base, a)?;
            if cond.is_truthy() {
                let target = (ip as i64 + 1 + decode_sbx(word) as i64) as usize;
                vm.top_frame_mut().ip = target;
            }
        }

        OpCode::MakeClosure => {
            let func = match proto.chunk.constants.get(decode_bx(word) as usize) {
                Some(Constant::Func(func)) => Rc::clone(func),
                _ => return Err(RuntimeError::msg("constant is not a function")),
            };
            let mut upvalues = Vec::with_capacity(func.upvalues.len());
            for desc in &func.upvalues {
                let handle = if desc.is_local {
                    vm.capture_upvalue(base + desc.index as usize)
                } else {
                    vm.closure_upvalue(desc.index)?
                };
                upvalues.push(handle);
            }
            let handle = vm.alloc(Obj::Closure {
                proto: func,
                upvalues,
            });
            vm.set_reg(base, a, Value::Obj(handle));
        }

        OpCode::Call => {
            let callee = vm.reg(base, a);
            if let Some(done) = vm.begin_call(callee, a, b, CallStyle::Plain)? {
                return Ok(Flow::Done(done));
            }
        }
        OpCode::CallSelf => {
            let callee = vm.self_callee()?;
            if let Some(done) = vm.begin_call(callee, a, b, CallStyle::Plain)? {
                return Ok(Flow::Done(done));
            }
        }
        OpCode::TailCall => {
            let callee = vm.reg(base, a);
            if let Some(done) = vm.begin_call(callee, a, b, CallStyle::Tail)? {
                return Ok(Flow::Done(done));
            }
        }
        OpCode::TailCallSelf => {
            let callee = vm.self_callee()?;
            if let Some(done) = vm.begin_call(callee, a, b, CallStyle::Tail)? {
                return Ok(Flow::Done(done));
            }
        }
        OpCode::SmartTailCall => {
            let callee = vm.reg(base, a);
            if let Some(done) = vm.begin_call(callee, a, b, CallStyle::Smart)? {
                return Ok(Flow::Done(done));
            }
        }
        OpCode::SmartTailCallSelf => {
            let callee = vm.self_callee()?;
            if let Some(done) = vm.begin_call(callee, a, b, CallStyle::Smart)? {
                return Ok(Flow::Done(done));
            }
        }
        OpCode::Return => {
            let ret = vm.reg(base, a);
            if let Some(value) = vm.do_return(ret) {
                return Ok(Flow::Done(value));
            }
        }
        OpCode::ReturnNull => {
            if let Some(value) = vm.do_return(Value::Null) {
                return Ok(Flow::Done(value));
            }
        }

        OpCode::MakeLocalRef => {
            let value = vm.make_reference(RefKind::Local(base + b as usize))?;
            vm.set_reg(base, a, value);
        }
        OpCode::MakeUpvalRef => {
            let handle = vm.closure_upvalue(b)?;
            let value = vm.make_reference(RefKind::Upvalue(handle))?;
            vm.set_reg(base, a, value);
        }
        OpCode::MakeGlobalRef => {
            let name = const_str(&proto, decode_bx(word))?;
            let slot = vm.ensure_global_slot(name);
            proto.chunk.cache_global_slot(ip, slot);
            let value = vm.make_reference(RefKind::Global(slot))?;
            vm.set_reg(base, a, value);
        }
        OpCode::MakeIndexRef => {
            let container = vm.deref_reg(base, b)?;
            let index = vm.deref_reg(base, c)?;
            let value = vm.make_reference(RefKind::Index { container, index })?;
            vm.set_reg(base, a, value);
        }
        OpCode::MakePropRef => {
            let container = vm.deref_reg(base, b)?;
            let key = vm.deref_reg(base, c)?;
            let value = vm.make_reference(RefKind::Property { container, key })?;
            vm.set_reg(base, a, value);
        }
        OpCode::Deref => {
            let value = vm.deref_reg(base, b)?;
            vm.set_reg(base, a, value);
        }
        OpCode::DerefSet => {
            let target = vm.reg(base, a);
            let value = vm.reg(base, b);
            if vm.is_reference(&target) {
                vm.write_reference(target, value, true)?;
            } else {
                vm.set_reg(base, a, value);
            }
        }
        OpCode::SlotSet => {
            let target = vm.reg(base, a);
            let value = vm.reg(base, b);
            if vm.is_reference(&target) {
                vm.write_reference(target, value, false)?;
            } else {
                vm.set_reg(base, a, value);
            }
        }
        OpCode::TypeOf => {
            let value = vm.reg(base, b);
            let name = vm.value_type_name(&value);
            let s = vm.alloc_str(name);
            vm.set_reg(base, a, s);
        }

        OpCode::MakePromptTag => {
            let name = const_str(&proto, decode_bx(word))?.to_string();
            let handle = vm.alloc(Obj::PromptTag { name });
            vm.set_reg(base, a, Value::Obj(handle));
        }
        OpCode::PushPrompt => {
            let tag = vm.prompt_tag(base, b)?;
            let entry = PromptEntry {
                tag,
                frame_count: vm.frames.len(),
                stack_base: vm.stack.len(),
                result_slot: base + a as usize,
            };
            vm.prompts.push(entry);
        }
        OpCode::PopPrompt => {
            let matches_here = vm
                .prompts
                .last()
                .is_some_and(|p| p.frame_count == vm.frames.len());
            if !matches_here {
                return Err(RuntimeError::msg("mismatched prompt pop"));
            }
            vm.prompts.pop();
        }
        OpCode::Capture => vm.capture_continuation(base, a, b)?,
        OpCode::Abort => vm.abort_to_prompt(base, a, b)?,
        OpCode::Resume => vm.resume_continuation(base, a, b, c)?,
    }

    Ok(Flow::Continue)
}

impl Vm {
    #[inline]
    pub(crate) fn reg(&self, base: usize, r: u8) -> Value {
        self.stack[base + r as usize]
    }

    #[inline]
    pub(crate) fn set_reg(&mut self, base: usize, r: u8, value: Value) {
        self.stack[base + r as usize] = value;
    }

    fn deref_reg(&mut self, base: usize, r: u8) -> Result<Value, RuntimeError> {
        let value = self.reg(base, r);
        self.deref_value(value)
    }

    fn top_frame_mut(&mut self) -> &mut crate::CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn load_constant(&mut self, proto: &FuncProto, index: u16) -> Result<Value, RuntimeError> {
        match proto.chunk.constants.get(index as usize) {
            Some(Constant::Num(n)) => Ok(Value::Num(*n)),
            Some(Constant::Str(s)) => {
                let s = s.clone();
                Ok(self.alloc_str(s))
            }
            Some(Constant::Func(func)) => {
                // Zero-capture functions can be loaded directly.
                let func = Rc::clone(func);
                if !func.upvalues.is_empty() {
                    return Err(RuntimeError::msg(
                        "function with upvalues requires MAKE_CLOSURE",
                    ));
                }
                let handle = self.alloc(Obj::Closure {
                    proto: func,
                    upvalues: Vec::new(),
                });
                Ok(Value::Obj(handle))
            }
            Some(Constant::EnumVariant { type_id, variant }) => Ok(Value::Enum {
                type_id: *type_id,
                variant: *variant,
            }),
            Some(Constant::Schema(_)) => {
                Err(RuntimeError::msg("schema constants are not loadable values"))
            }
            None => Err(RuntimeError::msg("constant index out of range")),
        }
    }

    /// Resolves a global-accessing instruction to its slot, consulting
    /// the chunk's side cache first. The global table is append-only, so
    /// a cached slot can never go stale.
    fn resolve_global(
        &mut self,
        proto: &FuncProto,
        offset: usize,
        name_const: u16,
    ) -> Result<u32, RuntimeError> {
        if let Some(slot) = proto.chunk.cached_global_slot(offset) {
            if self.config.collect_metrics {
                self.metrics.global_cache_hits += 1;
            }
            return Ok(slot);
        }
        if self.config.collect_metrics {
            self.metrics.global_cache_misses += 1;
        }
        let name = const_str(proto, name_const)?;
        let slot = self.lookup_global_slot(name).ok_or_else(|| {
            RuntimeError::msg(format!("undefined variable '{name}'"))
        })?;
        proto.chunk.cache_global_slot(offset, slot);
        Ok(slot)
    }

    fn closure_upvalue(&self, index: u8) -> Result<Handle, RuntimeError> {
        let frame = self.frames.last().expect("no active frame");
        let closure = frame
            .closure
            .ok_or_else(|| RuntimeError::msg("function has no captured variables"))?;
        match self.heap().get(closure) {
            Some(Obj::Closure { upvalues, .. }) => {
                upvalues.get(index as usize).copied().ok_or_else(|| {
                    RuntimeError::msg("upvalue index out of range")
                })
            }
            _ => panic!("frame closure handle does not resolve to a closure"),
        }
    }

    fn self_callee(&self) -> Result<Value, RuntimeError> {
        let frame = self.frames.last().expect("no active frame");
        match frame.closure {
            Some(handle) => Ok(Value::Obj(handle)),
            None => Err(RuntimeError::msg(
                "self-call outside a closure-backed function",
            )),
        }
    }

    fn prompt_tag(&mut self, base: usize, r: u8) -> Result<Handle, RuntimeError> {
        let value = self.deref_reg(base, r)?;
        if let Value::Obj(handle) = value {
            if matches!(self.heap().get(handle), Some(Obj::PromptTag { .. })) {
                return Ok(handle);
            }
        }
        Err(RuntimeError::msg(format!(
            "expected a prompt tag, got '{}'",
            self.value_type_name(&value)
        )))
    }

    // ----- arithmetic helpers -----------------------------------------

    fn deref_num(&mut self, base: usize, r: u8, verb: &str) -> Result<f64, RuntimeError> {
        let value = self.deref_reg(base, r)?;
        match value {
            Value::Num(n) => Ok(n),
            _ => Err(RuntimeError::msg(format!(
                "cannot {verb} a value of type '{}'",
                self.value_type_name(&value)
            ))),
        }
    }

    fn num_binop(
        &mut self,
        base: usize,
        a: u8,
        b: u8,
        c: u8,
        verb: &str,
        f: impl FnOnce(f64, f64) -> Result<f64, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let x = self.deref_num(base, b, verb)?;
        let y = self.deref_num(base, c, verb)?;
        let out = f(x, y)?;
        self.set_reg(base, a, Value::Num(out));
        Ok(())
    }

    fn cmp_binop(
        &mut self,
        base: usize,
        a: u8,
        b: u8,
        c: u8,
        f: impl FnOnce(f64, f64) -> bool,
    ) -> Result<(), RuntimeError> {
        let x = self.deref_num(base, b, "compare")?;
        let y = self.deref_num(base, c, "compare")?;
        self.set_reg(base, a, Value::Bool(f(x, y)));
        Ok(())
    }

    fn int_binop(
        &mut self,
        base: usize,
        a: u8,
        b: u8,
        c: u8,
        f: impl FnOnce(i32, i32) -> i32,
    ) -> Result<(), RuntimeError> {
        let x = self.deref_num(base, b, "apply a bitwise operator to")?;
        let y = self.deref_num(base, c, "apply a bitwise operator to")?;
        self.set_reg(base, a, Value::Num(f(to_int32(x), to_int32(y)) as f64));
        Ok(())
    }

    fn values_equal(&mut self, base: usize, b: u8, c: u8) -> Result<bool, RuntimeError> {
        let x = self.deref_reg(base, b)?;
        let y = self.deref_reg(base, c)?;
        match (&x, &y) {
            (Value::Num(x), Value::Num(y)) => Ok(x == y),
            (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
            (Value::Null, Value::Null) => Ok(true),
            (
                Value::Enum {
                    type_id: tx,
                    variant: vx,
                },
                Value::Enum {
                    type_id: ty,
                    variant: vy,
                },
            ) => {
                if tx != ty {
                    return Err(RuntimeError::msg(format!(
                        "cannot compare values of enum type '{}' with enum type '{}'",
                        self.enum_type_name(*tx),
                        self.enum_type_name(*ty)
                    )));
                }
                Ok(vx == vy)
            }
            (Value::Obj(hx), Value::Obj(hy)) => {
                if let (Some(xs), Some(ys)) = (self.str_value(&x), self.str_value(&y)) {
                    Ok(xs == ys)
                } else {
                    // Container and function equality is identity.
                    Ok(hx == hy)
                }
            }
            _ => Ok(false),
        }
    }

    // ----- call protocol ----------------------------------------------

    /// Resolves and invokes `callee`. Returns the machine's final value
    /// when the call completed the outermost frame (a tail call into a
    /// native from the last live frame).
    pub(crate) fn begin_call(
        &mut self,
        callee: Value,
        a: u8,
        argc: u8,
        style: CallStyle,
    ) -> Result<Option<Value>, RuntimeError> {
        let resolved = self.resolve_callee(callee, argc)?;
        match resolved {
            Resolved::Native {
                handler,
                qualifiers,
            } => {
                let caller_base = self.frames.last().expect("no active frame").base;
                let args =
                    self.qualified_args(caller_base, a, argc, qualifiers.as_deref())?;
                let mark = self.temp_roots.len();
                self.temp_roots.extend(args.iter().copied());
                let outcome = handler(self, &args);
                self.temp_roots.truncate(mark);
                match outcome {
                    NativeOutcome::Value(value) => match style {
                        CallStyle::Plain => {
                            self.set_reg(caller_base, a, value);
                            Ok(None)
                        }
                        // A tail call into a native is call-then-return.
                        CallStyle::Tail | CallStyle::Smart => Ok(self.do_return(value)),
                    },
                    NativeOutcome::Error(err) => Err(err),
                    NativeOutcome::Control => Ok(None),
                }
            }
            Resolved::Closure { handle, proto } => {
                let reuse = match style {
                    CallStyle::Plain => false,
                    CallStyle::Tail => true,
                    // Reusing the frame would tear down slots the new
                    // closure's upvalues alias, so fall back to a push.
                    CallStyle::Smart => proto.upvalues.is_empty(),
                };
                if reuse {
                    self.tail_call_closure(handle, proto, a, argc)?;
                } else {
                    self.plain_call_closure(handle, proto, a, argc)?;
                }
                Ok(None)
            }
        }
    }

    fn resolve_callee(&mut self, callee: Value, argc: u8) -> Result<Resolved, RuntimeError> {
        let mut callee = self.deref_value(callee)?;
        for _ in 0..4 {
            let Value::Obj(handle) = callee else { break };
            match self.heap().get(handle) {
                Some(Obj::Closure { proto, .. }) => {
                    let proto = Rc::clone(proto);
                    if proto.arity != argc {
                        return Err(RuntimeError::msg(format!(
                            "expected {} arguments but got {} for '{}'",
                            proto.arity, argc, proto.name
                        )));
                    }
                    return Ok(Resolved::Closure { handle, proto });
                }
                Some(Obj::Native(native)) => {
                    if native.arity != argc {
                        return Err(RuntimeError::msg(format!(
                            "expected {} arguments but got {} for '{}'",
                            native.arity, argc, native.name
                        )));
                    }
                    return Ok(Resolved::Native {
                        handler: Rc::clone(&native.handler),
                        qualifiers: native.qualifiers.clone(),
                    });
                }
                Some(Obj::Dispatcher { name, overloads }) => {
                    match overloads.get(&argc) {
                        Some(next) => {
                            callee = *next;
                            continue;
                        }
                        None => {
                            return Err(RuntimeError::msg(format!(
                                "no overload of '{name}' accepts {argc} arguments"
                            )))
                        }
                    }
                }
                _ => break,
            }
        }
        Err(RuntimeError::msg(format!(
            "can only call functions, not '{}'",
            self.value_type_name(&callee)
        )))
    }

    fn plain_call_closure(
        &mut self,
        handle: Handle,
        proto: Rc<FuncProto>,
        a: u8,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        let caller_base = self.frames.last().expect("no active frame").base;
        let return_slot = caller_base + a as usize;
        let arg_start = return_slot + 1;
        let sig = proto.qualifier_sig();
        let arity = proto.arity as usize;
        let callee_base = self.push_frame(proto, Some(handle), Some(return_slot))?;
        for i in 0..argc as usize {
            self.stack[callee_base + i] = self.stack[arg_start + i];
        }
        self.bind_params(callee_base, Some(arg_start), sig, arity)?;
        if self.config.collect_metrics {
            self.metrics.calls += 1;
        }
        Ok(())
    }

    /// Replaces the current frame with the callee's: arguments shuffle
    /// down to the frame base, the register window is resized, and the
    /// instruction pointer restarts at zero. Frame depth stays constant.
    fn tail_call_closure(
        &mut self,
        handle: Handle,
        proto: Rc<FuncProto>,
        a: u8,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        let base = self.frames.last().expect("no active frame").base;
        // Anything still aliasing this frame must be off the stack
        // before its slots are reused.
        self.close_upvalues(base);
        let arg_start = base + a as usize + 1;
        for i in 0..argc as usize {
            self.stack[base + i] = self.stack[arg_start + i];
        }
        let max_regs = proto.max_regs as usize;
        let top = base + max_regs;
        if top > self.config.stack_max {
            return Err(RuntimeError::msg("stack overflow: value stack exhausted"));
        }
        self.stack.resize(top, Value::Null);
        for i in argc as usize..max_regs {
            self.stack[base + i] = Value::Null;
        }
        let sig = proto.qualifier_sig();
        let arity = proto.arity as usize;
        {
            let frame = self.top_frame_mut();
            frame.proto = proto;
            frame.closure = Some(handle);
            frame.ip = 0;
        }
        // Qualifier processing runs after the shuffle; slot numbers
        // computed earlier would be stale.
        self.bind_params(base, None, sig, arity)?;
        if self.config.collect_metrics {
            self.metrics.tail_calls += 1;
        }
        trace!(depth = self.frames.len(), "tail call reused frame");
        Ok(())
    }

    /// Applies parameter qualifiers in place over the callee's bound
    /// argument slots. `arg_source` gives the caller-side slot of each
    /// argument for REF temporaries on the plain-call path; on tail
    /// paths the caller window is already gone and temporaries are
    /// pushed above the callee window instead.
    fn bind_params(
        &mut self,
        callee_base: usize,
        arg_source: Option<usize>,
        sig: QualifierSig,
        arity: usize,
    ) -> Result<(), RuntimeError> {
        match sig {
            QualifierSig::AllNormal => {
                for i in 0..arity {
                    let raw = self.stack[callee_base + i];
                    if self.is_reference(&raw) {
                        let value = self.deref_value(raw)?;
                        self.stack[callee_base + i] = value;
                    }
                }
            }
            QualifierSig::HasQualifiers => {
                let proto = Rc::clone(&self.frames.last().expect("no active frame").proto);
                for i in 0..arity {
                    let raw = self.stack[callee_base + i];
                    let source = arg_source.map(|s| s + i);
                    let bound = self.apply_qualifier(raw, proto.qualifier(i), source)?;
                    self.stack[callee_base + i] = bound;
                }
            }
        }
        Ok(())
    }

    fn apply_qualifier(
        &mut self,
        raw: Value,
        qualifier: Qualifier,
        source_slot: Option<usize>,
    ) -> Result<Value, RuntimeError> {
        match qualifier {
            Qualifier::Normal => self.deref_value(raw),
            Qualifier::Val => {
                let value = self.deref_value(raw)?;
                Ok(self.shallow_clone(value))
            }
            Qualifier::Clone => {
                let value = self.deref_value(raw)?;
                self.deep_clone(value, 0)
            }
            Qualifier::Slot => Ok(raw),
            Qualifier::Typeof => {
                let name = self.value_type_name(&raw);
                Ok(self.alloc_str(name))
            }
            Qualifier::Ref => {
                if let Some(kind) = self.reference_kind_of(&raw) {
                    // Already a reference; re-flatten only if its target
                    // holds another reference.
                    let target_is_ref = matches!(
                        self.read_location(&kind),
                        Ok(v) if self.is_reference(&v)
                    );
                    if target_is_ref {
                        self.make_reference(kind)
                    } else {
                        Ok(raw)
                    }
                } else {
                    // An rvalue argument: synthesize a slot for it so a
                    // LOCAL reference has something to point at.
                    let slot = match source_slot {
                        Some(slot) => slot,
                        None => {
                            self.stack.push(raw);
                            self.stack.len() - 1
                        }
                    };
                    self.make_reference(RefKind::Local(slot))
                }
            }
        }
    }

    fn qualified_args(
        &mut self,
        caller_base: usize,
        a: u8,
        argc: u8,
        qualifiers: Option<&[Qualifier]>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let mut args = Vec::with_capacity(argc as usize);
        for i in 0..argc as usize {
            let slot = caller_base + a as usize + 1 + i;
            let raw = self.stack[slot];
            let qualifier = qualifiers
                .and_then(|qs| qs.get(i).copied())
                .unwrap_or_default();
            args.push(self.apply_qualifier(raw, qualifier, Some(slot))?);
        }
        Ok(args)
    }

    /// Unwinds the top frame with `ret`. Returns the final value when
    /// that was the outermost frame.
    pub(crate) fn do_return(&mut self, ret: Value) -> Option<Value> {
        let frame_base = self.frames.last().expect("no active frame").base;
        // Order matters: escaping locals gain upvalues first, then the
        // frame's upvalues close while the slots are still live.
        self.protect_escaping_refs(ret, frame_base);
        self.close_upvalues(frame_base);
        let frame = self.frames.pop().expect("no active frame");
        self.stack.truncate(frame.base);

        // Prompts whose owner frame just died are dropped silently.
        while let Some(prompt) = self.prompts.last() {
            if prompt.frame_count > self.frames.len() {
                self.prompts.pop();
            } else {
                break;
            }
        }

        // A return crossing a resume boundary delivers into the slot the
        // resumer is waiting on, not the captured caller's.
        if let Some(entry) = self.resume_stack.last() {
            if self.frames.len() == entry.frame_boundary {
                let slot = entry.return_slot;
                self.resume_stack.pop();
                self.stack[slot] = ret;
                return None;
            }
        }

        if self.frames.is_empty() {
            return Some(ret);
        }
        if let Some(slot) = frame.return_slot {
            self.stack[slot] = ret;
        }
        None
    }

    // ----- delimited continuations ------------------------------------

    fn find_prompt(&mut self, base: usize, tag_reg: u8) -> Result<usize, RuntimeError> {
        let tag = self.prompt_tag(base, tag_reg)?;
        self.prompts
            .iter()
            .rposition(|p| p.tag == tag)
            .ok_or_else(|| {
                let name = match self.heap().get(tag) {
                    Some(Obj::PromptTag { name }) => name.clone(),
                    _ => "?".to_string(),
                };
                RuntimeError::msg(format!("no active prompt for tag '{name}'"))
            })
    }

    /// CAPTURE: packages every frame and stack slot above the matching
    /// prompt into a one-shot continuation, deposits it at the prompt's
    /// result slot, and lets the prompt's owner continue. The prompt
    /// entry itself stays installed; the owner's POP_PROMPT (or its
    /// return) removes it.
    fn capture_continuation(&mut self, base: usize, a: u8, tag_reg: u8) -> Result<(), RuntimeError> {
        let index = self.find_prompt(base, tag_reg)?;
        let (frame_count, stack_base, result_slot) = {
            let p = &self.prompts[index];
            (p.frame_count, p.stack_base, p.result_slot)
        };
        // Freeze the region: absolute slot indices inside it are about
        // to become meaningless.
        self.seal_region(stack_base);

        let resume_abs = base + a as usize;
        let mut frames = self.frames.split_off(frame_count);
        if frames.is_empty() {
            return Err(RuntimeError::msg(
                "cannot capture: no frames above the prompt",
            ));
        }
        for (i, frame) in frames.iter_mut().enumerate() {
            frame.base -= stack_base;
            frame.return_slot = if i == 0 {
                // The boundary frame's return is redirected at resume
                // time via the resume stack.
                None
            } else {
                frame.return_slot.map(|slot| slot - stack_base)
            };
        }
        let stack = self.stack.split_off(stack_base);
        let mut prompts = self.prompts.split_off(index + 1);
        for p in &mut prompts {
            p.frame_count -= frame_count;
            p.stack_base -= stack_base;
            p.result_slot -= stack_base;
        }
        let split = self
            .resume_stack
            .iter()
            .position(|e| e.frame_boundary > frame_count)
            .unwrap_or(self.resume_stack.len());
        let mut resume_entries = self.resume_stack.split_off(split);
        for e in &mut resume_entries {
            e.frame_boundary -= frame_count;
            e.return_slot -= stack_base;
        }

        let state = ContState {
            frames,
            stack,
            prompts,
            resume_entries,
            resume_slot: resume_abs - stack_base,
        };
        // Root the captured contents across the allocation.
        let mark = self.temp_roots.len();
        self.temp_roots.extend(state.stack.iter().copied());
        self.temp_roots
            .extend(state.frames.iter().filter_map(|f| f.closure.map(Value::Obj)));
        self.temp_roots
            .extend(state.prompts.iter().map(|p| Value::Obj(p.tag)));
        let handle = self.alloc(Obj::Continuation(Some(state)));
        self.temp_roots.truncate(mark);

        self.stack[result_slot] = Value::Obj(handle);
        if self.config.collect_metrics {
            self.metrics.continuations_captured += 1;
        }
        trace!(frames = self.frames.len(), "continuation captured");
        Ok(())
    }

    /// ABORT: discards the delimited region and delivers the value to
    /// the prompt's result slot.
    fn abort_to_prompt(&mut self, base: usize, a: u8, tag_reg: u8) -> Result<(), RuntimeError> {
        let index = self.find_prompt(base, tag_reg)?;
        let (frame_count, stack_base, result_slot) = {
            let p = &self.prompts[index];
            (p.frame_count, p.stack_base, p.result_slot)
        };
        // The abort value may carry references into the dying region.
        self.seal_region(stack_base);
        let value = self.reg(base, a);
        self.frames.truncate(frame_count);
        self.stack.truncate(stack_base);
        self.prompts.truncate(index + 1);
        while self
            .resume_stack
            .last()
            .is_some_and(|e| e.frame_boundary > frame_count)
        {
            self.resume_stack.pop();
        }
        self.stack[result_slot] = value;
        Ok(())
    }

    /// RESUME: splices a captured continuation back onto the machine at
    /// the current depth, rebasing every captured frame, prompt and
    /// resume entry. One-shot: a second resume of the same continuation
    /// is an error.
    fn resume_continuation(
        &mut self,
        base: usize,
        a: u8,
        cont_reg: u8,
        value_reg: u8,
    ) -> Result<(), RuntimeError> {
        let cont = self.deref_reg(base, cont_reg)?;
        let Value::Obj(handle) = cont else {
            return Err(RuntimeError::msg(format!(
                "cannot resume a value of type '{}'",
                self.value_type_name(&cont)
            )));
        };
        let state = match self.heap_mut().get_mut(handle) {
            Some(Obj::Continuation(state)) => state.take(),
            _ => {
                return Err(RuntimeError::msg(format!(
                    "cannot resume a value of type '{}'",
                    self.value_type_name(&cont)
                )))
            }
        };
        let Some(mut state) = state else {
            return Err(RuntimeError::msg(
                "continuation has already been resumed or aborted",
            ));
        };

        let frame_delta = self.frames.len();
        let stack_delta = self.stack.len();
        if frame_delta + state.frames.len() > self.config.frames_max
            || stack_delta + state.stack.len() > self.config.stack_max
        {
            // Put the state back; a failed resume must not consume it.
            if let Some(Obj::Continuation(slot)) = self.heap_mut().get_mut(handle) {
                *slot = Some(state);
            }
            return Err(RuntimeError::msg("stack overflow: cannot resume"));
        }

        state.stack[state.resume_slot] = self.reg(base, value_reg);
        for frame in &mut state.frames {
            frame.base += stack_delta;
            if let Some(slot) = &mut frame.return_slot {
                *slot += stack_delta;
            }
        }
        for prompt in &mut state.prompts {
            prompt.frame_count += frame_delta;
            prompt.stack_base += stack_delta;
            prompt.result_slot += stack_delta;
        }
        for entry in &mut state.resume_entries {
            entry.frame_boundary += frame_delta;
            entry.return_slot += stack_delta;
        }

        self.resume_stack.push(ResumeEntry {
            frame_boundary: frame_delta,
            return_slot: base + a as usize,
        });
        self.stack.extend(state.stack);
        self.frames.extend(state.frames);
        self.prompts.extend(state.prompts);
        self.resume_stack.extend(state.resume_entries);
        if self.config.collect_metrics {
            self.metrics.continuations_resumed += 1;
        }
        trace!(frames = self.frames.len(), "continuation resumed");
        Ok(())
    }

    // ----- cloning -----------------------------------------------------

    /// One-level copy: containers get a fresh spine, elements are
    /// shared. Immutable objects are shared outright.
    pub(crate) fn shallow_clone(&mut self, value: Value) -> Value {
        let Value::Obj(handle) = value else { return value };
        let cloned = match self.heap().get(handle) {
            Some(Obj::List(items)) => Some(Obj::List(items.clone())),
            Some(Obj::Map(entries)) => Some(Obj::Map(entries.clone())),
            Some(Obj::Struct { schema, fields }) => Some(Obj::Struct {
                schema: Rc::clone(schema),
                fields: fields.clone(),
            }),
            _ => None,
        };
        match cloned {
            Some(obj) => Value::Obj(self.alloc(obj)),
            None => value,
        }
    }

    /// Recursive copy of containers, dereferencing through any reference
    /// elements. Depth-bounded, so cyclic data faults instead of hanging.
    pub(crate) fn deep_clone(&mut self, value: Value, depth: usize) -> Result<Value, RuntimeError> {
        if depth >= MAX_CLONE_DEPTH {
            return Err(RuntimeError::msg("clone depth exceeded (cyclic value?)"));
        }
        let Value::Obj(handle) = value else {
            return Ok(value);
        };
        enum Plan {
            List(Vec<Value>),
            Map(Vec<(crate::MapKey, Value)>),
            Struct(Rc<zym_bytecode::StructSchema>, Vec<Value>),
            Share,
        }
        let plan = match self.heap().get(handle) {
            Some(Obj::List(items)) => Plan::List(items.clone()),
            Some(Obj::Map(entries)) => {
                Plan::Map(entries.iter().map(|(k, v)| (k.clone(), *v)).collect())
            }
            Some(Obj::Struct { schema, fields }) => {
                Plan::Struct(Rc::clone(schema), fields.clone())
            }
            _ => Plan::Share,
        };
        let mark = self.temp_roots.len();
        let out = match plan {
            Plan::Share => Ok(value),
            Plan::List(items) => {
                let mut cloned = Vec::with_capacity(items.len());
                for item in items {
                    let item = self.deref_value(item)?;
                    let item = self.deep_clone(item, depth + 1)?;
                    self.temp_roots.push(item);
                    cloned.push(item);
                }
                Ok(Value::Obj(self.alloc(Obj::List(cloned))))
            }
            Plan::Map(entries) => {
                let mut cloned = indexmap::IndexMap::with_capacity(entries.len());
                for (key, val) in entries {
                    let val = self.deref_value(val)?;
                    let val = self.deep_clone(val, depth + 1)?;
                    self.temp_roots.push(val);
                    cloned.insert(key, val);
                }
                Ok(Value::Obj(self.alloc(Obj::Map(cloned))))
            }
            Plan::Struct(schema, fields) => {
                let mut cloned = Vec::with_capacity(fields.len());
                for field in fields {
                    let field = self.deref_value(field)?;
                    let field = self.deep_clone(field, depth + 1)?;
                    self.temp_roots.push(field);
                    cloned.push(field);
                }
                Ok(Value::Obj(self.alloc(Obj::Struct {
                    schema,
                    fields: cloned,
                })))
            }
        };
        self.temp_roots.truncate(mark);
        out
    }
}

/// JS-style ToInt32: modulo 2^32 with wraparound into the signed range.
fn to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    const TWO_32: f64 = 4_294_967_296.0;
    let m = n.trunc() % TWO_32;
    let m = if m < 0.0 { m + TWO_32 } else { m };
    m as u32 as i32
}

fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

fn const_str(proto: &FuncProto, index: u16) -> Result<&str, RuntimeError> {
    match proto.chunk.constants.get(index as usize) {
        Some(Constant::Str(s)) => Ok(s),
        _ => Err(RuntimeError::msg("constant is not a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_int32_wraps_like_js() {
        assert_eq!(to_int32(0.0), 0);
        assert_eq!(to_int32(-1.0), -1);
        assert_eq!(to_int32(2_147_483_648.0), i32::MIN);
        assert_eq!(to_int32(4_294_967_296.0), 0);
        assert_eq!(to_int32(4_294_967_297.0), 1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
        assert_eq!(to_int32(-2.5), -2);
    }

    #[test]
    fn to_uint32_is_the_unsigned_view() {
        assert_eq!(to_uint32(-1.0), u32::MAX);
        assert_eq!(to_uint32(4_294_967_295.0), u32::MAX);
    }
}
