//! Debugger session: typed remote-debugging operations over gdb's REPL

mod reply;
mod session;

pub use reply::{parse_integer, Breakpoint, ReplyContract, ReplyParser, StopEvent, Unit};
pub use session::{DebuggerSession, ExecState};
