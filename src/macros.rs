// Writes one line to a `Logger`. `@ENDPT` lines are transport chatter and are
// only emitted with the `endpoint_logging` feature.
macro_rules! log {
    (@ENDPT, $logger:expr, $($arg:tt)*) => {{
        if cfg!(feature = "endpoint_logging") {
            log!($logger, $($arg)*);
        }
    }};
    ($logger:expr, $($arg:tt)*) => {{
        if cfg!(not(feature = "no_logging")) {
            if let Some(w) = $logger.line_writer() {
                let _ = writeln!(w, $($arg)*);
            }
        }
    }};
}
