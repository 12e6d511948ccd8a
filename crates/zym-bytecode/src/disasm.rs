//! Human-readable chunk listings.
//!
//! One line per instruction: offset, source line, mnemonic, operands, and a
//! resolved constant or jump target where one applies. Function constants
//! are disassembled recursively. This is a debugging aid; it shares the
//! opcode shape table with the interpreter, so a listing that decodes here
//! decodes identically in the dispatch loop.

use std::fmt::Write as _;

use crate::{
    decode_a, decode_b, decode_bx, decode_c, decode_op, decode_sbx, Constant, Chunk, FuncProto,
    OpCode, OperandShape,
};

/// Renders every instruction of `chunk`, recursing into function constants.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");

    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }

    for constant in &chunk.constants {
        if let Constant::Func(proto) = constant {
            out.push('\n');
            out.push_str(&disassemble_proto(proto));
        }
    }
    out
}

/// Renders a full function: header plus its chunk.
pub fn disassemble_proto(proto: &FuncProto) -> String {
    let header = format!(
        "{} (module {}, arity {}, regs {})",
        proto.name, proto.module, proto.arity, proto.max_regs
    );
    disassemble_chunk(&proto.chunk, &header)
}

/// Renders the instruction at `offset` into `out`; returns the offset of the
/// next instruction (skipping trailing immediate words).
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let word = chunk.code[offset];
    let line = chunk.line_at(offset);
    let _ = write!(out, "{offset:04} {line:>4} ");

    let Some(op) = decode_op(word) else {
        let _ = writeln!(out, "BAD_OPCODE 0x{:02x}", word & 0xFF);
        return offset + 1;
    };

    let a = decode_a(word);
    let b = decode_b(word);
    let c = decode_c(word);
    let bx = decode_bx(word);
    let _ = write!(out, "{:<22}", op.name());

    match op.shape() {
        OperandShape::None => {}
        OperandShape::A => {
            let _ = write!(out, "{a}");
        }
        OperandShape::Ab => {
            let _ = write!(out, "{a} {b}");
        }
        OperandShape::Abc => {
            let _ = write!(out, "{a} {b} {c}");
        }
        OperandShape::ABx => {
            let _ = write!(out, "{a} {bx}");
            if uses_constant(op) {
                let _ = write!(out, "  ; {}", constant_text(chunk, bx));
            }
        }
        OperandShape::ASBx => {
            let sbx = decode_sbx(word);
            let target = offset as i64 + 1 + sbx as i64;
            let _ = write!(out, "{a} {sbx}  ; -> {target:04}");
        }
        OperandShape::SBx => {
            let sbx = decode_sbx(word);
            let target = offset as i64 + 1 + sbx as i64;
            let _ = write!(out, "{sbx}  ; -> {target:04}");
        }
    }

    match op {
        OpCode::LoadNum => {
            let lo = chunk.code.get(offset + 1).copied().unwrap_or(0) as u64;
            let hi = chunk.code.get(offset + 2).copied().unwrap_or(0) as u64;
            let _ = write!(out, "  ; {}", f64::from_bits(lo | (hi << 32)));
        }
        OpCode::JumpLong => {
            let delta = chunk.code.get(offset + 1).copied().unwrap_or(0) as i32;
            let target = offset as i64 + 2 + delta as i64;
            let _ = write!(out, "{delta}  ; -> {target:04}");
        }
        _ => {}
    }

    out.push('\n');
    offset + 1 + op.trailing_words()
}

fn uses_constant(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::LoadConst
            | OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::MakeClosure
            | OpCode::MakeGlobalRef
            | OpCode::MakePromptTag
            | OpCode::MakeStruct
    )
}

fn constant_text(chunk: &Chunk, idx: u16) -> String {
    match chunk.constants.get(idx as usize) {
        None => format!("<bad const {idx}>"),
        Some(Constant::Num(n)) => format!("{n}"),
        Some(Constant::Str(s)) => format!("{s:?}"),
        Some(Constant::Func(proto)) => format!("<fn {}>", proto.name),
        Some(Constant::EnumVariant { type_id, variant }) => {
            format!("<enum {type_id}#{variant}>")
        }
        Some(Constant::Schema(schema)) => format!("<schema {}>", schema.name),
    }
}
