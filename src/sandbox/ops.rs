//! Console capture ops and the `component_sandbox` extension.
//!
//! These ops are the only host functions the isolate can reach. They are
//! captured by `bootstrap.js` at startup; the global `Deno` object is removed
//! before any component code runs.

use deno_core::{op2, OpState};
use serde::Serialize;

/// Entries kept per stream; anything beyond is counted, not stored.
pub const MAX_CONSOLE_ENTRIES: usize = 1000;

/// Console output captured from one sandboxed render.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
    /// Entries dropped after hitting [`MAX_CONSOLE_ENTRIES`].
    #[serde(skip_serializing_if = "is_zero")]
    pub dropped: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl ConsoleOutput {
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.warns.is_empty() && self.errors.is_empty()
    }

    pub(crate) fn push(&mut self, stream: Stream, msg: &str) {
        let entries = match stream {
            Stream::Log => &mut self.logs,
            Stream::Warn => &mut self.warns,
            Stream::Error => &mut self.errors,
        };
        if entries.len() < MAX_CONSOLE_ENTRIES {
            entries.push(msg.to_string());
        } else {
            self.dropped += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stream {
    Log,
    Warn,
    Error,
}

fn capture(state: &mut OpState, stream: Stream, msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.push(stream, msg);
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    capture(state, Stream::Log, msg);
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    capture(state, Stream::Warn, msg);
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    capture(state, Stream::Error, msg);
}

deno_core::extension!(
    component_sandbox,
    ops = [op_console_log, op_console_warn, op_console_error],
    esm_entry_point = "ext:component_sandbox/bootstrap.js",
    esm = ["ext:component_sandbox/bootstrap.js" = "src/sandbox/bootstrap.js"],
);
