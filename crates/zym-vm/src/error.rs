use std::fmt;

use thiserror::Error;

/// One level of a guest stack trace, innermost call first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub module: String,
    pub line: u32,
}

/// A guest-level runtime fault: type errors, arity mismatches, dead
/// references, out-of-bounds indexing and the like. These unwind the
/// interpreter loop but leave the [`crate::Vm`] itself intact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    /// A bare fault with no trace attached yet. The dispatch loop fills
    /// the trace in when the error first crosses it.
    pub fn msg(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            trace: Vec::new(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(
                f,
                "\n  [line {}] in {} ({})",
                frame.line, frame.function, frame.module
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Host-facing errors: misuse of the embedding API rather than faults in
/// guest code.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("unknown enum type or variant: {0}")]
    UnknownEnum(String),
    #[error("invalid host call state: {0}")]
    InvalidState(&'static str),
    #[error("value cannot cross the host boundary: {0}")]
    HostConvert(&'static str),
    #[error("chunk failed verification: {0}")]
    Verify(#[from] zym_bytecode::verify::VerifyError),
}
