// Best-effort stderr logging that never panics.
//
// A launcher embedded in a GUI process may have no console attached, and
// `eprintln!` panics on write errors. Runtime output is forwarded through this
// macro for the lifetime of the child, so failures are ignored instead.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
