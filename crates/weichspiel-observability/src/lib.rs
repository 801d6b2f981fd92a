pub mod safe_print;
pub mod trace;

pub use trace::{event, trace_path, Classified, Span, TraceError, TraceEvent};
