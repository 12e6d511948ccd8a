//! First-class reference semantics: flattening, write-through
//! assignment, the global rebind rule, escape promotion, and sealing of
//! captured or aborted regions.

mod common;

use common::*;
use zym_bytecode::OpCode;
use zym_vm::{HostValue, Vm};

#[test]
fn local_ref_writes_through() {
    let proto = script(3, |b| {
        b.emit_abx(OpCode::LoadInt, 0, 5, 1);
        b.emit_ab(OpCode::MakeLocalRef, 1, 0, 1);
        b.emit_abx(OpCode::LoadInt, 2, 9, 2);
        b.emit_ab(OpCode::DerefSet, 1, 2, 2);
        b.emit(OpCode::Return, 0, 0, 0, 3);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 9.0);
}

#[test]
fn ref_to_ref_flattens_at_construction() {
    // r2 is built over a slot that already holds a reference; it must
    // point straight at slot 0, not at the intermediate.
    let proto = script(4, |b| {
        b.emit_abx(OpCode::LoadInt, 0, 5, 1);
        b.emit_ab(OpCode::MakeLocalRef, 1, 0, 1);
        b.emit_ab(OpCode::MakeLocalRef, 2, 1, 2);
        b.emit_abx(OpCode::LoadInt, 3, 42, 3);
        b.emit_ab(OpCode::SlotSet, 2, 3, 3);
        b.emit(OpCode::Return, 0, 0, 0, 4);
    });
    // SLOT_SET does not chase chains, so the write landing in slot 0
    // proves the second reference was flattened past the first.
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 42.0);
}

#[test]
fn deref_set_chases_a_chain_slot_set_does_not() {
    // Slot 0 is given a reference to global g after r1 was constructed,
    // so r1 genuinely points at slot 0 while slot 0 aliases g.
    let chase = script(4, |b| {
        let g = b.add_str("g");
        b.emit_abx(OpCode::LoadInt, 0, 5, 1);
        b.emit_ab(OpCode::MakeLocalRef, 1, 0, 1);
        b.emit_abx(OpCode::LoadInt, 2, 1, 2);
        b.emit_abx(OpCode::DefineGlobal, 2, g, 2);
        b.emit_abx(OpCode::MakeGlobalRef, 0, g, 3);
        b.emit_abx(OpCode::LoadInt, 2, 7, 4);
        b.emit_ab(OpCode::DerefSet, 1, 2, 4);
        b.emit_abx(OpCode::GetGlobal, 3, g, 5);
        b.emit(OpCode::Return, 3, 0, 0, 5);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(chase)), 7.0);

    let replace = script(4, |b| {
        let g = b.add_str("g");
        b.emit_abx(OpCode::LoadInt, 0, 5, 1);
        b.emit_ab(OpCode::MakeLocalRef, 1, 0, 1);
        b.emit_abx(OpCode::LoadInt, 2, 1, 2);
        b.emit_abx(OpCode::DefineGlobal, 2, g, 2);
        b.emit_abx(OpCode::MakeGlobalRef, 0, g, 3);
        b.emit_abx(OpCode::LoadInt, 2, 7, 4);
        b.emit_ab(OpCode::SlotSet, 1, 2, 4);
        // The alias in slot 0 was overwritten; g is untouched.
        b.emit(OpCode::Return, 0, 0, 0, 5);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(replace)), 7.0);
    assert_eq!(vm.global_value("g"), Some(HostValue::Num(1.0)));
}

#[test]
fn global_alias_rebinds_instead_of_writing_through() {
    let proto = script(6, |b| {
        let a = b.add_str("a");
        let bee = b.add_str("b");
        let alias = b.add_str("alias");
        b.emit_abx(OpCode::LoadInt, 0, 1, 1);
        b.emit_abx(OpCode::DefineGlobal, 0, a, 1);
        b.emit_abx(OpCode::LoadInt, 0, 2, 1);
        b.emit_abx(OpCode::DefineGlobal, 0, bee, 1);
        b.emit_abx(OpCode::MakeGlobalRef, 1, a, 2);
        b.emit_abx(OpCode::DefineGlobal, 1, alias, 2);
        // Plain value through the alias writes through to a.
        b.emit_abx(OpCode::LoadInt, 2, 99, 3);
        b.emit_abx(OpCode::SetGlobal, 2, alias, 3);
        // A reference value rebinds the alias itself; a keeps 99.
        b.emit_abx(OpCode::MakeGlobalRef, 3, bee, 4);
        b.emit_abx(OpCode::SetGlobal, 3, alias, 4);
        b.emit_abx(OpCode::LoadInt, 4, 7, 5);
        b.emit_abx(OpCode::SetGlobal, 4, alias, 5);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 6);
    });
    let mut vm = Vm::new();
    expect_done(vm.run_script(proto));
    assert_eq!(vm.global_value("a"), Some(HostValue::Num(99.0)));
    assert_eq!(vm.global_value("b"), Some(HostValue::Num(7.0)));
}

#[test]
fn list_element_holding_ref_writes_through() {
    let proto = script(7, |b| {
        let a = b.add_str("a");
        let g = b.add_str("g");
        b.emit_abx(OpCode::LoadInt, 0, 1, 1);
        b.emit_abx(OpCode::DefineGlobal, 0, a, 1);
        b.emit_abx(OpCode::MakeGlobalRef, 1, a, 2);
        b.emit(OpCode::MakeList, 0, 1, 1, 2);
        b.emit_abx(OpCode::DefineGlobal, 0, g, 2);
        // g[0] = 99 diverts through the reference element.
        b.emit_abx(OpCode::GetGlobal, 2, g, 3);
        b.emit_abx(OpCode::LoadInt, 3, 0, 3);
        b.emit_abx(OpCode::LoadInt, 4, 99, 3);
        b.emit(OpCode::SetIndex, 2, 3, 4, 3);
        b.emit_abx(OpCode::GetGlobal, 5, a, 4);
        b.emit(OpCode::Return, 5, 0, 0, 4);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 99.0);
}

#[test]
fn index_ref_writes_the_targeted_element_only() {
    // g = [1, 2, 3]; r = ref g[1]; *r = 99 leaves [1, 99, 3].
    let proto = script(8, |b| {
        b.emit_abx(OpCode::LoadInt, 1, 1, 1);
        b.emit_abx(OpCode::LoadInt, 2, 2, 1);
        b.emit_abx(OpCode::LoadInt, 3, 3, 1);
        b.emit(OpCode::MakeList, 0, 1, 3, 1);
        b.emit_abx(OpCode::LoadInt, 4, 1, 2);
        b.emit(OpCode::MakeIndexRef, 5, 0, 4, 2);
        b.emit_abx(OpCode::LoadInt, 6, 99, 3);
        b.emit_ab(OpCode::DerefSet, 5, 6, 3);
        b.emit_abx(OpCode::LoadInt, 4, 0, 4);
        b.emit(OpCode::GetIndex, 1, 0, 4, 4);
        b.emit_abx(OpCode::LoadInt, 4, 1, 4);
        b.emit(OpCode::GetIndex, 2, 0, 4, 4);
        b.emit_abx(OpCode::LoadInt, 4, 2, 4);
        b.emit(OpCode::GetIndex, 3, 0, 4, 4);
        // Pack the elements into one number: e0*10000 + e1*100 + e2.
        b.emit_abx(OpCode::LoadInt, 4, 10000, 5);
        b.emit(OpCode::Mul, 1, 1, 4, 5);
        b.emit_abx(OpCode::LoadInt, 4, 100, 5);
        b.emit(OpCode::Mul, 2, 2, 4, 5);
        b.emit(OpCode::Add, 1, 1, 2, 5);
        b.emit(OpCode::Add, 1, 1, 3, 5);
        b.emit(OpCode::Return, 1, 0, 0, 6);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 19_903.0);
}

#[test]
fn chained_collection_refs_fault_on_write() {
    // outer[0] is given an index ref into inner only after r7 (a ref to
    // outer[0]) was constructed, so the write through r7 lands on an
    // element that itself holds a collection reference.
    let proto = script(8, |b| {
        b.emit_abx(OpCode::LoadInt, 1, 10, 1);
        b.emit_abx(OpCode::LoadInt, 2, 20, 1);
        b.emit(OpCode::MakeList, 0, 1, 2, 1);
        b.emit_abx(OpCode::LoadInt, 1, 0, 2);
        b.emit(OpCode::MakeList, 5, 1, 1, 2);
        b.emit_abx(OpCode::LoadInt, 3, 0, 3);
        b.emit(OpCode::MakeIndexRef, 7, 5, 3, 3);
        b.emit_abx(OpCode::LoadInt, 3, 1, 4);
        b.emit(OpCode::MakeIndexRef, 4, 0, 3, 4);
        b.emit_abx(OpCode::LoadInt, 3, 0, 5);
        b.emit(OpCode::SetIndex, 5, 3, 4, 5);
        b.emit_abx(OpCode::LoadInt, 6, 7, 6);
        b.emit_ab(OpCode::DerefSet, 7, 6, 6);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 7);
    });
    let mut vm = Vm::new();
    let err = expect_error(vm.run_script(proto));
    assert!(
        err.message.contains("nested collection references"),
        "{err}"
    );
}

#[test]
fn circular_reference_chain_is_detected() {
    // a = ref b while b is undefined, then b = ref a; flattening makes
    // b a reference to its own slot.
    let proto = script(4, |b| {
        let a = b.add_str("a");
        let bee = b.add_str("b");
        b.emit_abx(OpCode::MakeGlobalRef, 0, bee, 1);
        b.emit_abx(OpCode::DefineGlobal, 0, a, 1);
        b.emit_abx(OpCode::MakeGlobalRef, 1, a, 2);
        b.emit_abx(OpCode::DefineGlobal, 1, bee, 2);
        b.emit_abx(OpCode::GetGlobal, 2, bee, 3);
        b.emit_ab(OpCode::Deref, 3, 2, 3);
        b.emit(OpCode::Return, 3, 0, 0, 3);
    });
    let mut vm = Vm::new();
    let err = expect_error(vm.run_script(proto));
    assert!(err.message.contains("circular reference chain"), "{err}");
}

#[test]
fn overlong_reference_chain_is_rejected() {
    // Build g0 -> g1 -> ... -> g65 -> g66 where every link is created
    // before its target is defined, defeating construction flattening.
    let proto = script(3, |b| {
        let names: Vec<u16> = (0..=66).map(|i| b.add_str(format!("g{i}"))).collect();
        for i in 0..=65usize {
            b.emit_abx(OpCode::MakeGlobalRef, 0, names[i + 1], 1);
            b.emit_abx(OpCode::DefineGlobal, 0, names[i], 1);
        }
        b.emit_abx(OpCode::GetGlobal, 1, names[0], 2);
        b.emit_ab(OpCode::Deref, 2, 1, 2);
        b.emit(OpCode::Return, 2, 0, 0, 2);
    });
    let mut vm = Vm::new();
    let err = expect_error(vm.run_script(proto));
    assert!(err.message.contains("reference chain too long"), "{err}");
}

#[test]
fn returned_local_ref_survives_frame_exit() {
    let inner = func("leak", 0, 2, None, Vec::new(), |b| {
        b.emit_abx(OpCode::LoadInt, 0, 5, 1);
        b.emit_ab(OpCode::MakeLocalRef, 1, 0, 1);
        b.emit(OpCode::Return, 1, 0, 0, 2);
    });
    let proto = script(3, |b| {
        let f = b.add_const(zym_bytecode::Constant::Func(inner));
        b.emit_abx(OpCode::LoadConst, 0, f, 1);
        b.emit(OpCode::Call, 0, 0, 0, 1);
        // The slot it pointed at is gone; the promoted upvalue remains
        // readable and writable.
        b.emit_ab(OpCode::Deref, 1, 0, 2);
        b.emit_abx(OpCode::LoadInt, 2, 42, 3);
        b.emit_ab(OpCode::DerefSet, 0, 2, 3);
        b.emit_ab(OpCode::Deref, 2, 0, 4);
        b.emit(OpCode::Add, 1, 1, 2, 4);
        b.emit(OpCode::Return, 1, 0, 0, 4);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 47.0);
}

#[test]
fn unprotected_local_ref_dies_with_its_frame() {
    // A reference stashed in a global (not returned) is not promoted;
    // dereferencing it after the frame unwinds is a dead-reference
    // fault, not a read of recycled stack memory.
    let inner = func("stash", 0, 2, None, Vec::new(), |b| {
        let hole = b.add_str("hole");
        b.emit_abx(OpCode::LoadInt, 0, 5, 1);
        b.emit_ab(OpCode::MakeLocalRef, 1, 0, 1);
        b.emit_abx(OpCode::DefineGlobal, 1, hole, 1);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 2);
    });
    let proto = script(2, |b| {
        let f = b.add_const(zym_bytecode::Constant::Func(inner));
        let hole = b.add_str("hole");
        b.emit_abx(OpCode::LoadConst, 0, f, 1);
        b.emit(OpCode::Call, 0, 0, 0, 1);
        b.emit_abx(OpCode::GetGlobal, 0, hole, 2);
        b.emit_ab(OpCode::Deref, 1, 0, 2);
        b.emit(OpCode::Return, 1, 0, 0, 2);
    });
    let mut vm = Vm::new();
    let err = expect_error(vm.run_script(proto));
    assert!(err.message.contains("dead reference"), "{err}");
}

#[test]
fn abort_seals_hundreds_of_refs_across_frames() {
    // 301 frames each park a reference to one of their locals in a map,
    // then the innermost aborts. Sealing must promote every one of them
    // in a single event; there is no fixed cap on closures per close.
    let f = func("park", 1, 8, None, Vec::new(), |b| {
        let refs = b.add_str("refs");
        let f_name = b.add_str("park");
        let tag = b.add_str("tag");
        b.emit_ab(OpCode::Move, 1, 0, 1);
        b.emit_ab(OpCode::MakeLocalRef, 2, 1, 1);
        b.emit_abx(OpCode::GetGlobal, 3, refs, 2);
        b.emit(OpCode::SetIndex, 3, 0, 2, 2);
        b.emit_abx(OpCode::LoadInt, 4, 0, 3);
        b.emit(OpCode::Equal, 5, 0, 4, 3);
        let done = b.emit_jump(OpCode::JumpIfTrue, 5, 3);
        b.emit_abx(OpCode::GetGlobal, 5, f_name, 4);
        b.emit_abx(OpCode::LoadInt, 6, 1, 4);
        b.emit(OpCode::Sub, 6, 0, 6, 4);
        b.emit(OpCode::Call, 5, 1, 0, 4);
        b.emit(OpCode::ReturnNull, 0, 0, 0, 5);
        b.patch_jump(done);
        b.emit_abx(OpCode::GetGlobal, 5, tag, 6);
        b.emit(OpCode::LoadNull, 6, 0, 0, 6);
        b.emit(OpCode::Abort, 6, 5, 0, 6);
    });
    let proto = script(12, |b| {
        let f_const = b.add_const(zym_bytecode::Constant::Func(f));
        let t = b.add_str("t");
        let tag = b.add_str("tag");
        let refs = b.add_str("refs");
        let f_name = b.add_str("park");
        b.emit_abx(OpCode::MakePromptTag, 1, t, 1);
        b.emit_abx(OpCode::DefineGlobal, 1, tag, 1);
        b.emit(OpCode::MakeMap, 0, 0, 0, 2);
        b.emit_abx(OpCode::DefineGlobal, 0, refs, 2);
        b.emit_abx(OpCode::LoadConst, 2, f_const, 3);
        b.emit_abx(OpCode::DefineGlobal, 2, f_name, 3);
        b.emit(OpCode::PushPrompt, 4, 1, 0, 4);
        b.emit_ab(OpCode::Move, 4, 2, 4);
        b.emit_abx(OpCode::LoadInt, 5, 300, 4);
        b.emit(OpCode::Call, 4, 1, 0, 4);
        b.emit(OpCode::PopPrompt, 0, 0, 0, 5);
        // Every parked reference must still read its own value.
        b.emit_abx(OpCode::LoadInt, 5, 0, 6);
        b.emit_abx(OpCode::LoadInt, 6, 0, 6);
        b.emit_abx(OpCode::LoadInt, 7, 300, 6);
        let top = b.offset();
        b.emit(OpCode::Greater, 8, 6, 7, 7);
        let exit = b.emit_jump(OpCode::JumpIfTrue, 8, 7);
        b.emit_abx(OpCode::GetGlobal, 9, refs, 8);
        b.emit(OpCode::GetIndex, 10, 9, 6, 8);
        b.emit_ab(OpCode::Deref, 10, 10, 8);
        b.emit(OpCode::Add, 5, 5, 10, 8);
        b.emit_abx(OpCode::LoadInt, 8, 1, 9);
        b.emit(OpCode::Add, 6, 6, 8, 9);
        b.emit_loop(top, 9);
        b.patch_jump(exit);
        b.emit(OpCode::Return, 5, 0, 0, 10);
    });
    let mut vm = Vm::new();
    assert_eq!(expect_num(vm.run_script(proto)), 45150.0);
}
