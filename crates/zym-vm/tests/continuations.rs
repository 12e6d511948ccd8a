//! One-shot delimited continuations: prompts, capture, abort, resume
//! and the return-redirection across a resume boundary.

mod common;

use std::rc::Rc;

use common::*;
use zym_bytecode::{Constant, FuncProto, OpCode};
use zym_vm::{Vm, VmConfig};

/// body(tag): captures, then returns resume value + 1.
fn capture_body() -> Rc<FuncProto> {
    func("body", 1, 3, None, Vec::new(), |b| {
        b.emit_ab(OpCode::Capture, 1, 0, 1);
        b.emit_abx(OpCode::LoadInt, 2, 1, 2);
        b.emit(OpCode::Add, 1, 1, 2, 2);
        b.emit(OpCode::Return, 1, 0, 0, 2);
    })
}

#[test]
fn capture_then_resume_round_trip() {
    let body = capture_body();
    let proto = script(6, |b| {
        let t = b.add_str("t");
        let body = b.add_const(Constant::Func(body));
        b.emit_abx(OpCode::MakePromptTag, 0, t, 1);
        b.emit_abx(OpCode::LoadConst, 1, body, 1);
        b.emit_ab(OpCode::PushPrompt, 2, 0, 2);
        b.emit_ab(OpCode::Move, 2, 1, 2);
        b.emit_ab(OpCode::Move, 3, 0, 2);
        b.emit(OpCode::Call, 2, 1, 0, 2);
        // The capture lands here with the continuation in r2.
        b.emit(OpCode::PopPrompt, 0, 0, 0, 3);
        b.emit_ab(OpCode::Move, 3, 2, 4);
        b.emit_abx(OpCode::LoadInt, 5, 41, 4);
        b.emit(OpCode::Resume, 4, 3, 5, 4);
        // body's return crossed the resume boundary into r4.
        b.emit(OpCode::Return, 4, 0, 0, 5);
    });
    let mut vm = Vm::with_config(VmConfig {
        collect_metrics: true,
        ..VmConfig::default()
    });
    assert_eq!(expect_num(vm.run_script(proto)), 42.0);
    assert_eq!(vm.metrics().continuations_captured, 1);
    assert_eq!(vm.metrics().continuations_resumed, 1);
}

#[test]
fn second_resume_of_same_continuation_faults() {
    let body = capture_body();
    let proto = script(7, |b| {
        let t = b.add_str("t");
        let body = b.add_const(Constant::Func(body));
        b.emit_abx(OpCode::MakePromptTag, 0, t, 1);
        b.emit_abx(OpCode::LoadConst, 1, body, 1);
        b.emit_ab(OpCode::PushPrompt, 2, 0, 2);
        b.emit_ab(OpCode::Move, 2, 1, 2);
        b.emit_ab(OpCode::Move, 3, 0, 2);
        b.emit(OpCode::Call, 2, 1, 0, 2);
        b.emit(OpCode::PopPrompt, 0, 0, 0, 3);
        b.emit_ab(OpCode::Move, 3, 2, 4);
        b.emit_abx(OpCode::LoadInt, 5, 41, 4);
        b.emit(OpCode::Resume, 4, 3, 5, 4);
        b.emit(OpCode::Resume, 6, 3, 5, 5);
        b.emit(OpCode::Return, 6, 0, 0, 5);
    });
    let mut vm = Vm::new();
    let err = expect_error(vm.run_script(proto));
    assert!(err.message.contains("already been resumed"), "{err}");
}

#[test]
fn abort_delivers_value_to_prompt_slot() {
    let body = func("body", 1, 2, None, Vec::new(), |b| {
        b.emit_abx(OpCode::LoadInt, 1, 7, 1);
        b.emit_ab(OpCode::Abort, 1, 0, 1);
    });
    let proto = script(4, |b| {
        let t = b.add_str("t");
        let body = b.add_const(Constant::Func(body));
        b.emit_abx(OpCode::MakePromptTag, 0, t, 1);
        b.emit_abx(OpCode::LoadConst, 1, body, 1);
        b.emit_ab(OpCode::PushPrompt, 2, 0, 2);
        b.emit_ab(OpCode::Move, 2, 1, 2);
        b.emit_ab(OpCode::Move, 3, 0, 2);
        b.emit(OpCode::Call, 2, 1, 0, 2);
        b.emit(OpCode::PopPrompt, 0, 0, 0, 3);
        b.emit(OpCode::Return, 2, 0, 0, 3);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 7.0);
}

#[test]
fn abort_targets_prompt_by_tag_not_position() {
    // Two prompts are installed; the abort names the outer tag, so the
    // inner delimiter dies with the region and the value lands in the
    // outer prompt's slot.
    let body = func("body", 1, 2, None, Vec::new(), |b| {
        b.emit_abx(OpCode::LoadInt, 1, 9, 1);
        b.emit_ab(OpCode::Abort, 1, 0, 1);
    });
    let proto = script(6, |b| {
        let outer = b.add_str("outer");
        let inner = b.add_str("inner");
        let body = b.add_const(Constant::Func(body));
        b.emit_abx(OpCode::MakePromptTag, 0, outer, 1);
        b.emit_abx(OpCode::MakePromptTag, 1, inner, 1);
        b.emit_abx(OpCode::LoadConst, 2, body, 2);
        b.emit_ab(OpCode::PushPrompt, 3, 0, 2);
        b.emit_ab(OpCode::PushPrompt, 3, 1, 2);
        b.emit_ab(OpCode::Move, 3, 2, 3);
        b.emit_ab(OpCode::Move, 4, 0, 3);
        b.emit(OpCode::Call, 3, 1, 0, 3);
        // Only the outer prompt survived the abort.
        b.emit(OpCode::PopPrompt, 0, 0, 0, 4);
        b.emit(OpCode::Return, 3, 0, 0, 4);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 9.0);
}

#[test]
fn capture_without_matching_prompt_faults() {
    let body = capture_body();
    let proto = script(4, |b| {
        let t = b.add_str("t");
        let body = b.add_const(Constant::Func(body));
        b.emit_abx(OpCode::MakePromptTag, 0, t, 1);
        b.emit_abx(OpCode::LoadConst, 1, body, 1);
        b.emit_ab(OpCode::Move, 2, 1, 2);
        b.emit_ab(OpCode::Move, 3, 0, 2);
        b.emit(OpCode::Call, 2, 1, 0, 2);
        b.emit(OpCode::Return, 2, 0, 0, 3);
    });
    let mut vm = Vm::new();
    let err = expect_error(vm.run_script(proto));
    assert!(err.message.contains("no active prompt for tag 't'"), "{err}");
}

#[test]
fn pop_prompt_without_prompt_faults() {
    let proto = script(1, |b| {
        b.emit(OpCode::PopPrompt, 0, 0, 0, 1);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 1);
    });
    let mut vm = Vm::new();
    let err = expect_error(vm.run_script(proto));
    assert!(err.message.contains("mismatched prompt pop"), "{err}");
}

#[test]
fn returning_owner_discards_its_prompt() {
    // The owner function returns without POP_PROMPT after a capture;
    // the prompt entry must not outlive the frame that installed it.
    let body = func("body", 1, 2, None, Vec::new(), |b| {
        b.emit_ab(OpCode::Capture, 1, 0, 1);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 1);
    });
    let owner = func("owner", 1, 4, None, Vec::new(), |b| {
        let body = b.add_const(Constant::Func(body));
        b.emit_abx(OpCode::LoadConst, 1, body, 1);
        b.emit_ab(OpCode::PushPrompt, 2, 0, 2);
        b.emit_ab(OpCode::Move, 2, 1, 2);
        b.emit_ab(OpCode::Move, 3, 0, 2);
        b.emit(OpCode::Call, 2, 1, 0, 2);
        // No POP_PROMPT; the return must clean the entry up.
        b.emit_abx(OpCode::LoadInt, 1, 5, 3);
        b.emit(OpCode::Return, 1, 0, 0, 3);
    });
    let proto = script(4, |b| {
        let t = b.add_str("t");
        let owner = b.add_const(Constant::Func(owner));
        b.emit_abx(OpCode::MakePromptTag, 0, t, 1);
        b.emit_abx(OpCode::LoadConst, 1, owner, 1);
        b.emit_ab(OpCode::Move, 2, 1, 2);
        b.emit_ab(OpCode::Move, 3, 0, 2);
        b.emit(OpCode::Call, 2, 1, 0, 2);
        // A stale entry would make this pop succeed spuriously.
        b.emit(OpCode::PopPrompt, 0, 0, 0, 3);
        b.emit(OpCode::Return, 2, 0, 0, 3);
    });
    let mut vm = Vm::new();
    let err = expect_error(vm.run_script(proto));
    assert!(err.message.contains("mismatched prompt pop"), "{err}");
}

#[test]
fn captured_locals_survive_via_sealing() {
    // body parks a reference to its own local in a global, captures,
    // and is never resumed. Sealing at capture closed the slot, so the
    // reference stays readable even though the frame left the stack.
    let body = func("body", 1, 3, None, Vec::new(), |b| {
        let hole = b.add_str("hole");
        b.emit_abx(OpCode::LoadInt, 1, 33, 1);
        b.emit_ab(OpCode::MakeLocalRef, 2, 1, 1);
        b.emit_abx(OpCode::DefineGlobal, 2, hole, 1);
        b.emit_ab(OpCode::Capture, 1, 0, 2);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 2);
    });
    let proto = script(5, |b| {
        let t = b.add_str("t");
        let hole = b.add_str("hole");
        let body = b.add_const(Constant::Func(body));
        b.emit_abx(OpCode::MakePromptTag, 0, t, 1);
        b.emit_abx(OpCode::LoadConst, 1, body, 1);
        b.emit_ab(OpCode::PushPrompt, 2, 0, 2);
        b.emit_ab(OpCode::Move, 2, 1, 2);
        b.emit_ab(OpCode::Move, 3, 0, 2);
        b.emit(OpCode::Call, 2, 1, 0, 2);
        b.emit(OpCode::PopPrompt, 0, 0, 0, 3);
        b.emit_abx(OpCode::GetGlobal, 4, hole, 4);
        b.emit_ab(OpCode::Deref, 4, 4, 4);
        b.emit(OpCode::Return, 4, 0, 0, 4);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 33.0);
}

#[test]
fn resume_runs_the_suspended_region_to_its_own_return() {
    // The captured region is two frames deep; the resumed computation
    // finishes both frames and only then crosses the boundary.
    let inner = func("inner", 1, 3, None, Vec::new(), |b| {
        b.emit_ab(OpCode::Capture, 1, 0, 1);
        b.emit_abx(OpCode::LoadInt, 2, 100, 2);
        b.emit(OpCode::Add, 1, 1, 2, 2);
        b.emit(OpCode::Return, 1, 0, 0, 2);
    });
    let middle = func("middle", 1, 4, None, Vec::new(), |b| {
        let inner = b.add_const(Constant::Func(inner));
        b.emit_abx(OpCode::LoadConst, 1, inner, 1);
        b.emit_ab(OpCode::Move, 2, 1, 1);
        b.emit_ab(OpCode::Move, 3, 0, 1);
        b.emit(OpCode::Call, 2, 1, 0, 1);
        // Runs only when the continuation is resumed.
        b.emit_abx(OpCode::LoadInt, 3, 1000, 2);
        b.emit(OpCode::Add, 2, 2, 3, 2);
        b.emit(OpCode::Return, 2, 0, 0, 2);
    });
    let proto = script(6, |b| {
        let t = b.add_str("t");
        let middle = b.add_const(Constant::Func(middle));
        b.emit_abx(OpCode::MakePromptTag, 0, t, 1);
        b.emit_abx(OpCode::LoadConst, 1, middle, 1);
        b.emit_ab(OpCode::PushPrompt, 2, 0, 2);
        b.emit_ab(OpCode::Move, 2, 1, 2);
        b.emit_ab(OpCode::Move, 3, 0, 2);
        b.emit(OpCode::Call, 2, 1, 0, 2);
        b.emit(OpCode::PopPrompt, 0, 0, 0, 3);
        b.emit_ab(OpCode::Move, 3, 2, 4);
        b.emit_abx(OpCode::LoadInt, 5, 1, 4);
        b.emit(OpCode::Resume, 4, 3, 5, 4);
        b.emit(OpCode::Return, 4, 0, 0, 5);
    });
    let mut vm = Vm::new();
    // 1 (resume value) + 100 (inner) + 1000 (middle).
    assert_eq!(expect_num(vm.run_script(proto)), 1101.0);
}
