//! Bytecode format consumed by the Zym VM.
//!
//! A compiled function is a [`FuncProto`]: metadata plus a [`Chunk`] of
//! fixed-width 32-bit instruction words with a parallel source-line table and
//! a constant pool. Instruction words decode as `{op:8, a:8, b:8, c:8}` or
//! `{op:8, a:8, bx:16}`; a few opcodes consume additional trailing immediate
//! words ([`OpCode::trailing_words`]). The VM's interpreter and the
//! disassembler share this decode table, so the two cannot disagree on
//! instruction shapes.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;

pub mod disasm;
pub mod verify;

pub use disasm::{disassemble_chunk, disassemble_instruction};
pub use verify::{verify_chunk, verify_proto, VerifyError};

/// Sentinel for an unresolved entry in a chunk's global-slot side cache.
pub const GLOBAL_CACHE_EMPTY: u32 = u32::MAX;

/// One opcode per instruction word. The discriminant is the low byte of the
/// encoded word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // Loads.
    LoadConst = 0,
    LoadNum,
    LoadInt,
    LoadNull,
    LoadTrue,
    LoadFalse,
    Move,

    // Globals. Resolution is cached per instruction offset in the chunk's
    // side table; the words themselves are immutable.
    DefineGlobal,
    GetGlobal,
    SetGlobal,

    // Upvalues.
    GetUpvalue,
    SetUpvalue,
    CloseUpvalues,
    CloseFrameUpvalues,

    // Containers.
    MakeList,
    MakeMap,
    MakeStruct,
    GetIndex,
    SetIndex,
    GetField,
    SetField,

    // Arithmetic / comparison / logic.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Negate,
    Not,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    Ushr,

    // Control flow.
    Jump,
    JumpLong,
    JumpIfFalse,
    JumpIfTrue,

    // Closures and calls.
    MakeClosure,
    Call,
    CallSelf,
    TailCall,
    TailCallSelf,
    SmartTailCall,
    SmartTailCallSelf,
    Return,
    ReturnNull,

    // References.
    MakeLocalRef,
    MakeUpvalRef,
    MakeGlobalRef,
    MakeIndexRef,
    MakePropRef,
    Deref,
    DerefSet,
    SlotSet,
    TypeOf,

    // Delimited continuations.
    MakePromptTag,
    PushPrompt,
    PopPrompt,
    Capture,
    Abort,
    Resume,
}

/// Decoded operand layout of an opcode, used by the disassembler and the
/// verifier. The interpreter reads fields directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandShape {
    /// No operands.
    None,
    /// `a` only.
    A,
    /// `a`, `b`.
    Ab,
    /// `a`, `b`, `c`.
    Abc,
    /// `a` plus a 16-bit `bx` immediate.
    ABx,
    /// `a` plus a signed 16-bit jump offset.
    ASBx,
    /// Signed 16-bit jump offset only.
    SBx,
}

impl OpCode {
    pub const COUNT: usize = OpCode::Resume as usize + 1;

    pub fn from_byte(byte: u8) -> Option<OpCode> {
        if (byte as usize) < Self::COUNT {
            // Discriminants are dense starting at zero.
            Some(ALL_OPCODES[byte as usize])
        } else {
            None
        }
    }

    /// Number of extra 32-bit words following the instruction word.
    pub fn trailing_words(self) -> usize {
        match self {
            OpCode::LoadNum => 2,
            OpCode::JumpLong => 1,
            _ => 0,
        }
    }

    pub fn shape(self) -> OperandShape {
        use OpCode::*;
        match self {
            LoadNull | LoadTrue | LoadFalse | CloseUpvalues | PopPrompt | Return | LoadNum => {
                OperandShape::A
            }
            CloseFrameUpvalues | ReturnNull | JumpLong => OperandShape::None,
            Move | Negate | Not | BitNot | GetUpvalue | SetUpvalue | Deref | DerefSet | SlotSet
            | TypeOf | MakeLocalRef | MakeUpvalRef | Capture | Abort | PushPrompt | Call
            | CallSelf | TailCall | TailCallSelf | SmartTailCall | SmartTailCallSelf => {
                OperandShape::Ab
            }
            Add | Sub | Mul | Div | Mod | Equal | NotEqual | Less | LessEqual | Greater
            | GreaterEqual | BitAnd | BitOr | BitXor | Shl | Shr | Ushr | GetIndex | SetIndex
            | GetField | SetField | MakeList | MakeMap | MakeIndexRef | MakePropRef | Resume => {
                OperandShape::Abc
            }
            LoadConst | LoadInt | DefineGlobal | GetGlobal | SetGlobal | MakeClosure
            | MakeGlobalRef | MakePromptTag | MakeStruct => OperandShape::ABx,
            JumpIfFalse | JumpIfTrue => OperandShape::ASBx,
            Jump => OperandShape::SBx,
        }
    }

    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            LoadConst => "LOAD_CONST",
            LoadNum => "LOAD_NUM",
            LoadInt => "LOAD_INT",
            LoadNull => "LOAD_NULL",
            LoadTrue => "LOAD_TRUE",
            LoadFalse => "LOAD_FALSE",
            Move => "MOVE",
            DefineGlobal => "DEF_GLOBAL",
            GetGlobal => "GET_GLOBAL",
            SetGlobal => "SET_GLOBAL",
            GetUpvalue => "GET_UPVALUE",
            SetUpvalue => "SET_UPVALUE",
            CloseUpvalues => "CLOSE_UPVALUES",
            CloseFrameUpvalues => "CLOSE_FRAME_UPVALUES",
            MakeList => "MAKE_LIST",
            MakeMap => "MAKE_MAP",
            MakeStruct => "MAKE_STRUCT",
            GetIndex => "GET_INDEX",
            SetIndex => "SET_INDEX",
            GetField => "GET_FIELD",
            SetField => "SET_FIELD",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Negate => "NEGATE",
            Not => "NOT",
            Equal => "EQ",
            NotEqual => "NE",
            Less => "LT",
            LessEqual => "LE",
            Greater => "GT",
            GreaterEqual => "GE",
            BitAnd => "BAND",
            BitOr => "BOR",
            BitXor => "BXOR",
            BitNot => "BNOT",
            Shl => "SHL",
            Shr => "SHR",
            Ushr => "USHR",
            Jump => "JMP",
            JumpLong => "JMP_L",
            JumpIfFalse => "JMP_IF_FALSE",
            JumpIfTrue => "JMP_IF_TRUE",
            MakeClosure => "MAKE_CLOSURE",
            Call => "CALL",
            CallSelf => "CALL_SELF",
            TailCall => "TAIL_CALL",
            TailCallSelf => "TAIL_CALL_SELF",
            SmartTailCall => "SMART_TAIL_CALL",
            SmartTailCallSelf => "SMART_TAIL_CALL_SELF",
            Return => "RET",
            ReturnNull => "RET_NULL",
            MakeLocalRef => "MAKE_REF",
            MakeUpvalRef => "MAKE_UPVAL_REF",
            MakeGlobalRef => "MAKE_GLOBAL_REF",
            MakeIndexRef => "MAKE_INDEX_REF",
            MakePropRef => "MAKE_PROP_REF",
            Deref => "DEREF",
            DerefSet => "DEREF_SET",
            SlotSet => "SLOT_SET",
            TypeOf => "TYPEOF",
            MakePromptTag => "MAKE_PROMPT_TAG",
            PushPrompt => "PUSH_PROMPT",
            PopPrompt => "POP_PROMPT",
            Capture => "CAPTURE",
            Abort => "ABORT",
            Resume => "RESUME",
        }
    }
}

/// Dense opcode table backing [`OpCode::from_byte`].
const ALL_OPCODES: [OpCode; OpCode::COUNT] = {
    use OpCode::*;
    [
        LoadConst,
        LoadNum,
        LoadInt,
        LoadNull,
        LoadTrue,
        LoadFalse,
        Move,
        DefineGlobal,
        GetGlobal,
        SetGlobal,
        GetUpvalue,
        SetUpvalue,
        CloseUpvalues,
        CloseFrameUpvalues,
        MakeList,
        MakeMap,
        MakeStruct,
        GetIndex,
        SetIndex,
        GetField,
        SetField,
        Add,
        Sub,
        Mul,
        Div,
        Mod,
        Negate,
        Not,
        Equal,
        NotEqual,
        Less,
        LessEqual,
        Greater,
        GreaterEqual,
        BitAnd,
        BitOr,
        BitXor,
        BitNot,
        Shl,
        Shr,
        Ushr,
        Jump,
        JumpLong,
        JumpIfFalse,
        JumpIfTrue,
        MakeClosure,
        Call,
        CallSelf,
        TailCall,
        TailCallSelf,
        SmartTailCall,
        SmartTailCallSelf,
        Return,
        ReturnNull,
        MakeLocalRef,
        MakeUpvalRef,
        MakeGlobalRef,
        MakeIndexRef,
        MakePropRef,
        Deref,
        DerefSet,
        SlotSet,
        TypeOf,
        MakePromptTag,
        PushPrompt,
        PopPrompt,
        Capture,
        Abort,
        Resume,
    ]
};

// Word encoding helpers. `op` occupies the low byte so a word is readable in
// hex dumps low-to-high as op/a/b/c.

#[inline]
pub fn encode_abc(op: OpCode, a: u8, b: u8, c: u8) -> u32 {
    (op as u32) | ((a as u32) << 8) | ((b as u32) << 16) | ((c as u32) << 24)
}

#[inline]
pub fn encode_abx(op: OpCode, a: u8, bx: u16) -> u32 {
    (op as u32) | ((a as u32) << 8) | ((bx as u32) << 16)
}

#[inline]
pub fn encode_asbx(op: OpCode, a: u8, sbx: i16) -> u32 {
    encode_abx(op, a, sbx as u16)
}

#[inline]
pub fn decode_op(word: u32) -> Option<OpCode> {
    OpCode::from_byte((word & 0xFF) as u8)
}

#[inline]
pub fn decode_a(word: u32) -> u8 {
    ((word >> 8) & 0xFF) as u8
}

#[inline]
pub fn decode_b(word: u32) -> u8 {
    ((word >> 16) & 0xFF) as u8
}

#[inline]
pub fn decode_c(word: u32) -> u8 {
    ((word >> 24) & 0xFF) as u8
}

#[inline]
pub fn decode_bx(word: u32) -> u16 {
    ((word >> 16) & 0xFFFF) as u16
}

#[inline]
pub fn decode_sbx(word: u32) -> i16 {
    decode_bx(word) as i16
}

/// Formal-parameter binding mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Qualifier {
    /// Dereference to a concrete value; containers shared by handle.
    #[default]
    Normal,
    /// Pass a reference; synthesize a temporary slot for rvalue arguments.
    Ref,
    /// Dereference then shallow-clone.
    Val,
    /// Pass the binding itself, reference or not.
    Slot,
    /// Dereference then deep-clone.
    Clone,
    /// Bind the human-readable type name of the argument, undereferenced.
    Typeof,
}

/// Coarse classification of a parameter list, used to fast-path binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QualifierSig {
    /// Every parameter is `Normal`; arguments still need a dereference pass.
    AllNormal,
    /// At least one parameter carries a non-default qualifier.
    HasQualifiers,
}

/// Upvalue capture recipe entry: capture either a slot of the enclosing
/// frame or an upvalue of the enclosing closure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub is_local: bool,
    pub index: u8,
}

/// A struct shape shared by every instance created from it.
#[derive(Debug, PartialEq, Eq)]
pub struct StructSchema {
    pub name: String,
    pub fields: Vec<String>,
}

impl StructSchema {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}

/// A constant-pool entry.
#[derive(Clone, Debug)]
pub enum Constant {
    Num(f64),
    Str(String),
    Func(Rc<FuncProto>),
    EnumVariant { type_id: u16, variant: u16 },
    Schema(Rc<StructSchema>),
}

/// A flat instruction stream plus its constant pool and line table.
///
/// `lines` parallels `code` word-for-word (trailing immediate words repeat
/// the instruction's line). `global_cache` is the interpreter's lazily
/// allocated side table of resolved global slots, indexed by instruction
/// offset; words themselves are never rewritten.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u32>,
    pub lines: Vec<u32>,
    pub constants: Vec<Constant>,
    pub global_cache: RefCell<Vec<u32>>,
}

impl Chunk {
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    /// Looks up the cached global slot for the instruction at `offset`.
    pub fn cached_global_slot(&self, offset: usize) -> Option<u32> {
        let cache = self.global_cache.borrow();
        match cache.get(offset).copied() {
            Some(slot) if slot != GLOBAL_CACHE_EMPTY => Some(slot),
            _ => None,
        }
    }

    /// Records a resolved global slot for the instruction at `offset`. The
    /// cache vector is allocated on first use.
    pub fn cache_global_slot(&self, offset: usize, slot: u32) {
        let mut cache = self.global_cache.borrow_mut();
        if cache.is_empty() {
            cache.resize(self.code.len(), GLOBAL_CACHE_EMPTY);
        }
        if let Some(entry) = cache.get_mut(offset) {
            *entry = slot;
        }
    }
}

/// Immutable compiled-function metadata.
#[derive(Debug)]
pub struct FuncProto {
    pub name: String,
    pub module: String,
    pub arity: u8,
    /// Number of register slots the function's frame occupies.
    pub max_regs: u8,
    /// Per-parameter binding modes; `None` means all-`Normal`.
    pub qualifiers: Option<Box<[Qualifier]>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub chunk: Chunk,
}

impl FuncProto {
    /// Wraps a top-level chunk as a zero-arity script function.
    pub fn script(module: impl Into<String>, chunk: Chunk, max_regs: u8) -> Self {
        FuncProto {
            name: "<script>".to_string(),
            module: module.into(),
            arity: 0,
            max_regs,
            qualifiers: None,
            upvalues: Vec::new(),
            chunk,
        }
    }

    pub fn qualifier_sig(&self) -> QualifierSig {
        match &self.qualifiers {
            None => QualifierSig::AllNormal,
            Some(qs) if qs.iter().all(|q| *q == Qualifier::Normal) => QualifierSig::AllNormal,
            Some(_) => QualifierSig::HasQualifiers,
        }
    }

    pub fn qualifier(&self, param: usize) -> Qualifier {
        self.qualifiers
            .as_ref()
            .and_then(|qs| qs.get(param).copied())
            .unwrap_or_default()
    }
}

/// Mangled lookup name used by the host-call API: `name@arity`.
pub fn mangle(name: &str, arity: u8) -> String {
    format!("{name}@{arity}")
}

/// Emit-style chunk construction, used by the compiler and by tests that
/// hand-assemble programs.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    chunk: Chunk,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_word(&mut self, word: u32, line: u32) -> usize {
        let offset = self.chunk.code.len();
        self.chunk.code.push(word);
        self.chunk.lines.push(line);
        offset
    }

    /// Emits an `{op, a, b, c}` word; returns its offset.
    pub fn emit(&mut self, op: OpCode, a: u8, b: u8, c: u8, line: u32) -> usize {
        debug_assert_eq!(op.trailing_words(), 0, "{} needs immediates", op.name());
        self.push_word(encode_abc(op, a, b, c), line)
    }

    /// Emits a two-operand word with a zero `c` field.
    pub fn emit_ab(&mut self, op: OpCode, a: u8, b: u8, line: u32) -> usize {
        self.emit(op, a, b, 0, line)
    }

    /// Emits an `{op, a, bx}` word; returns its offset.
    pub fn emit_abx(&mut self, op: OpCode, a: u8, bx: u16, line: u32) -> usize {
        self.push_word(encode_abx(op, a, bx), line)
    }

    /// Emits `LOAD_NUM a` with its two trailing immediate words.
    pub fn emit_load_num(&mut self, a: u8, value: f64, line: u32) -> usize {
        let offset = self.push_word(encode_abc(OpCode::LoadNum, a, 0, 0), line);
        let bits = value.to_bits();
        self.push_word((bits & 0xFFFF_FFFF) as u32, line);
        self.push_word((bits >> 32) as u32, line);
        offset
    }

    /// Emits `JMP_L` with a 32-bit relative offset in a trailing word, for
    /// jumps beyond the `i16` range of `JMP`.
    pub fn emit_jump_long(&mut self, delta: i32, line: u32) -> usize {
        let offset = self.push_word(encode_abc(OpCode::JumpLong, 0, 0, 0), line);
        self.push_word(delta as u32, line);
        offset
    }

    /// Emits a forward jump with a zero offset, to be patched later.
    pub fn emit_jump(&mut self, op: OpCode, a: u8, line: u32) -> usize {
        debug_assert!(matches!(
            op,
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue
        ));
        self.push_word(encode_abx(op, a, 0), line)
    }

    /// Patches the jump at `offset` to land on the next emitted instruction.
    pub fn patch_jump(&mut self, offset: usize) {
        let target = self.chunk.code.len();
        let delta = target as i64 - (offset as i64 + 1);
        let sbx = i16::try_from(delta).expect("jump offset out of i16 range");
        let word = self.chunk.code[offset];
        self.chunk.code[offset] = (word & 0xFFFF) | ((sbx as u16 as u32) << 16);
    }

    /// Emits an unconditional backward jump to `target`.
    pub fn emit_loop(&mut self, target: usize, line: u32) -> usize {
        let here = self.chunk.code.len();
        let delta = target as i64 - (here as i64 + 1);
        let sbx = i16::try_from(delta).expect("loop offset out of i16 range");
        self.push_word(encode_asbx(OpCode::Jump, 0, sbx), line)
    }

    pub fn add_const(&mut self, constant: Constant) -> u16 {
        let idx = self.chunk.constants.len();
        self.chunk.constants.push(constant);
        u16::try_from(idx).expect("constant pool overflow")
    }

    pub fn add_str(&mut self, s: impl Into<String>) -> u16 {
        self.add_const(Constant::Str(s.into()))
    }

    pub fn add_num(&mut self, n: f64) -> u16 {
        self.add_const(Constant::Num(n))
    }

    pub fn offset(&self) -> usize {
        self.chunk.code.len()
    }

    pub fn finish(self) -> Chunk {
        self.chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrips_through_byte() {
        for byte in 0..OpCode::COUNT as u8 {
            let op = OpCode::from_byte(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert_eq!(OpCode::from_byte(OpCode::COUNT as u8), None);
        assert_eq!(OpCode::from_byte(0xFF), None);
    }

    #[test]
    fn abc_fields_roundtrip() {
        let word = encode_abc(OpCode::Add, 1, 2, 3);
        assert_eq!(decode_op(word), Some(OpCode::Add));
        assert_eq!(decode_a(word), 1);
        assert_eq!(decode_b(word), 2);
        assert_eq!(decode_c(word), 3);
    }

    #[test]
    fn sbx_encodes_negative_offsets() {
        let word = encode_asbx(OpCode::Jump, 0, -5);
        assert_eq!(decode_sbx(word), -5);
    }

    #[test]
    fn load_num_occupies_three_words() {
        let mut b = ChunkBuilder::new();
        b.emit_load_num(0, 1.5, 1);
        let chunk = b.finish();
        assert_eq!(chunk.code.len(), 3);
        let bits = (chunk.code[1] as u64) | ((chunk.code[2] as u64) << 32);
        assert_eq!(f64::from_bits(bits), 1.5);
        assert_eq!(chunk.lines, vec![1, 1, 1]);
    }

    #[test]
    fn patch_jump_targets_next_instruction() {
        let mut b = ChunkBuilder::new();
        let jump = b.emit_jump(OpCode::JumpIfFalse, 0, 1);
        b.emit(OpCode::LoadNull, 0, 0, 0, 2);
        b.patch_jump(jump);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 3);
        let chunk = b.finish();
        // Offset 0 jumps over one instruction: ip 1 + delta 1 = 2.
        assert_eq!(decode_sbx(chunk.code[jump]), 1);
    }

    #[test]
    fn global_cache_is_lazy_and_sticky() {
        let mut b = ChunkBuilder::new();
        b.emit_abx(OpCode::GetGlobal, 0, 0, 1);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 1);
        let chunk = b.finish();

        assert_eq!(chunk.cached_global_slot(0), None);
        chunk.cache_global_slot(0, 7);
        assert_eq!(chunk.cached_global_slot(0), Some(7));
        assert_eq!(chunk.cached_global_slot(1), None);
    }

    #[test]
    fn qualifier_sig_ignores_explicit_all_normal() {
        let mut proto = FuncProto::script("test", Chunk::default(), 0);
        assert_eq!(proto.qualifier_sig(), QualifierSig::AllNormal);

        proto.qualifiers = Some(vec![Qualifier::Normal, Qualifier::Normal].into());
        assert_eq!(proto.qualifier_sig(), QualifierSig::AllNormal);

        proto.qualifiers = Some(vec![Qualifier::Normal, Qualifier::Ref].into());
        assert_eq!(proto.qualifier_sig(), QualifierSig::HasQualifiers);
    }

    #[test]
    fn mangled_names_follow_name_at_arity() {
        assert_eq!(mangle("fib", 1), "fib@1");
    }
}
