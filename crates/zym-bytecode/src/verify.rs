//! Structural chunk validation.
//!
//! The verifier walks a chunk exactly the way the interpreter's decoder
//! does (including trailing immediate words) and rejects streams the
//! dispatch loop would have to treat as VM-bug invariant violations:
//! unknown opcodes, truncated immediates, register operands outside the
//! function's register window, constant indices out of range, and jumps
//! that do not land on an instruction boundary.

use std::collections::BTreeSet;

use crate::{
    decode_a, decode_b, decode_c, decode_bx, decode_op, decode_sbx, Chunk, Constant, FuncProto,
    OpCode, OperandShape,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub message: String,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "verify error: {}", self.message)
    }
}

impl std::error::Error for VerifyError {}

fn err(message: String) -> VerifyError {
    VerifyError { message }
}

/// Verifies a function and, recursively, every function constant it holds.
pub fn verify_proto(proto: &FuncProto) -> Result<(), VerifyError> {
    if proto.arity as usize > proto.max_regs as usize {
        return Err(err(format!(
            "function `{}`: arity {} exceeds register count {}",
            proto.name, proto.arity, proto.max_regs
        )));
    }
    if let Some(qs) = &proto.qualifiers {
        if qs.len() != proto.arity as usize {
            return Err(err(format!(
                "function `{}`: {} qualifiers for arity {}",
                proto.name,
                qs.len(),
                proto.arity
            )));
        }
    }
    verify_chunk(&proto.chunk, proto.max_regs)?;
    for constant in &proto.chunk.constants {
        if let Constant::Func(inner) = constant {
            verify_proto(inner)?;
        }
    }
    Ok(())
}

/// Verifies one chunk against a register window of `max_regs` slots.
pub fn verify_chunk(chunk: &Chunk, max_regs: u8) -> Result<(), VerifyError> {
    if chunk.lines.len() != chunk.code.len() {
        return Err(err(format!(
            "line table length {} does not match code length {}",
            chunk.lines.len(),
            chunk.code.len()
        )));
    }

    // First pass: collect instruction boundaries.
    let mut boundaries = BTreeSet::new();
    let mut offset = 0;
    while offset < chunk.code.len() {
        boundaries.insert(offset);
        let word = chunk.code[offset];
        let Some(op) = decode_op(word) else {
            return Err(err(format!(
                "unknown opcode 0x{:02x} at offset {offset}",
                word & 0xFF
            )));
        };
        let next = offset + 1 + op.trailing_words();
        if next > chunk.code.len() {
            return Err(err(format!(
                "{} at offset {offset} is missing trailing immediate words",
                op.name()
            )));
        }
        offset = next;
    }

    let check_reg = |reg: u8, what: &str, offset: usize| -> Result<(), VerifyError> {
        if reg as usize >= max_regs as usize {
            return Err(err(format!(
                "{what} register {reg} at offset {offset} outside window of {max_regs}"
            )));
        }
        Ok(())
    };
    let check_const = |idx: u16, offset: usize| -> Result<(), VerifyError> {
        if idx as usize >= chunk.constants.len() {
            return Err(err(format!(
                "constant index {idx} at offset {offset} out of range ({})",
                chunk.constants.len()
            )));
        }
        Ok(())
    };
    // Count-consuming opcodes read a run of consecutive registers; the
    // whole run has to fit the window, not just its first slot.
    let check_span = |start: usize, count: usize, offset: usize, op: OpCode| {
        if start + count > max_regs as usize {
            return Err(err(format!(
                "{} at offset {offset} spans registers {start}..{} outside window of {max_regs}",
                op.name(),
                start + count
            )));
        }
        Ok(())
    };

    // Second pass: operand ranges and jump targets.
    let mut offset = 0;
    while offset < chunk.code.len() {
        let word = chunk.code[offset];
        let op = decode_op(word).expect("checked in first pass");
        let a = decode_a(word);
        let b = decode_b(word);
        let c = decode_c(word);

        match op.shape() {
            OperandShape::None => {}
            OperandShape::A => check_reg(a, "a", offset)?,
            OperandShape::Ab => {
                check_reg(a, "a", offset)?;
                match op {
                    // b is an upvalue index, not a register.
                    OpCode::GetUpvalue | OpCode::SetUpvalue | OpCode::MakeUpvalRef => {}
                    // b is an argument count; the arguments occupy the
                    // registers right above the callee slot.
                    OpCode::Call
                    | OpCode::CallSelf
                    | OpCode::TailCall
                    | OpCode::TailCallSelf
                    | OpCode::SmartTailCall
                    | OpCode::SmartTailCallSelf => {
                        check_span(a as usize + 1, b as usize, offset, op)?
                    }
                    _ => check_reg(b, "b", offset)?,
                }
            }
            OperandShape::Abc => {
                check_reg(a, "a", offset)?;
                check_reg(b, "b", offset)?;
                match op {
                    // c is an element count; elements start at b.
                    OpCode::MakeList => check_span(b as usize, c as usize, offset, op)?,
                    // c counts key/value pairs, two registers each.
                    OpCode::MakeMap => check_span(b as usize, 2 * c as usize, offset, op)?,
                    _ => check_reg(c, "c", offset)?,
                }
            }
            OperandShape::ABx => {
                check_reg(a, "a", offset)?;
                match op {
                    OpCode::LoadConst
                    | OpCode::DefineGlobal
                    | OpCode::GetGlobal
                    | OpCode::SetGlobal
                    | OpCode::MakeClosure
                    | OpCode::MakeGlobalRef
                    | OpCode::MakePromptTag
                    | OpCode::MakeStruct => check_const(decode_bx(word), offset)?,
                    _ => {}
                }
                if op == OpCode::MakeStruct {
                    // Field values occupy the registers right above a.
                    if let Some(Constant::Schema(schema)) =
                        chunk.constants.get(decode_bx(word) as usize)
                    {
                        check_span(a as usize + 1, schema.fields.len(), offset, op)?;
                    }
                }
            }
            OperandShape::ASBx | OperandShape::SBx => {
                if op.shape() == OperandShape::ASBx {
                    check_reg(a, "a", offset)?;
                }
                let target = offset as i64 + 1 + decode_sbx(word) as i64;
                check_target(&boundaries, chunk, target, offset, op)?;
            }
        }

        if op == OpCode::JumpLong {
            let delta = chunk.code[offset + 1] as i32;
            let target = offset as i64 + 2 + delta as i64;
            check_target(&boundaries, chunk, target, offset, op)?;
        }

        offset += 1 + op.trailing_words();
    }

    Ok(())
}

fn check_target(
    boundaries: &BTreeSet<usize>,
    chunk: &Chunk,
    target: i64,
    offset: usize,
    op: OpCode,
) -> Result<(), VerifyError> {
    // A jump to one-past-the-end is a fall-off; the dispatch loop treats it
    // as an implicit null return, so allow it.
    if target == chunk.code.len() as i64 {
        return Ok(());
    }
    let ok = usize::try_from(target)
        .map(|t| boundaries.contains(&t))
        .unwrap_or(false);
    if !ok {
        return Err(err(format!(
            "{} at offset {offset} jumps to {target}, not an instruction boundary",
            op.name()
        )));
    }
    Ok(())
}
