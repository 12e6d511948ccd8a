//! Hand-assembly helpers shared by the integration suites.
#![allow(dead_code)]

use std::rc::Rc;

use zym_bytecode::{verify_proto, ChunkBuilder, FuncProto, Qualifier, UpvalueDesc};
use zym_vm::{HostValue, Outcome, RuntimeError};

/// Builds a zero-arity script proto and checks it against the verifier,
/// so the suites can't accidentally run malformed bytecode.
pub fn script(max_regs: u8, build: impl FnOnce(&mut ChunkBuilder)) -> Rc<FuncProto> {
    func("<script>", 0, max_regs, None, Vec::new(), build)
}

pub fn func(
    name: &str,
    arity: u8,
    max_regs: u8,
    qualifiers: Option<Box<[Qualifier]>>,
    upvalues: Vec<UpvalueDesc>,
    build: impl FnOnce(&mut ChunkBuilder),
) -> Rc<FuncProto> {
    let mut builder = ChunkBuilder::new();
    build(&mut builder);
    let proto = FuncProto {
        name: name.to_string(),
        module: "test".to_string(),
        arity,
        max_regs,
        qualifiers,
        upvalues,
        chunk: builder.finish(),
    };
    verify_proto(&proto).expect("test bytecode failed verification");
    Rc::new(proto)
}

#[track_caller]
pub fn expect_done(outcome: Outcome) -> HostValue {
    match outcome {
        Outcome::Done(value) => value,
        Outcome::Yield => panic!("expected completion, vm yielded"),
        Outcome::Error(err) => panic!("expected completion, got error: {err}"),
    }
}

#[track_caller]
pub fn expect_num(outcome: Outcome) -> f64 {
    match expect_done(outcome) {
        HostValue::Num(n) => n,
        other => panic!("expected a number, got {other:?}"),
    }
}

#[track_caller]
pub fn expect_str(outcome: Outcome) -> String {
    match expect_done(outcome) {
        HostValue::Str(s) => s,
        other => panic!("expected a string, got {other:?}"),
    }
}

#[track_caller]
pub fn expect_error(outcome: Outcome) -> RuntimeError {
    match outcome {
        Outcome::Error(err) => err,
        Outcome::Done(value) => panic!("expected an error, got {value:?}"),
        Outcome::Yield => panic!("expected an error, vm yielded"),
    }
}
