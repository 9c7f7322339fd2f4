use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the process-wide root logger: a terminal sink on stderr at `level`, matching
/// `neutronium`'s child-logger-per-connection convention. Callers attach `client_id` /
/// `ledger_id` key-value pairs via `log.new(o!(...))` rather than formatting them by hand.
pub fn build(level: Severity) -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.destination(Destination::Stderr);
    builder.level(level);
    builder.build().expect("terminal logger builder cannot fail")
}

/// A logger that discards everything, for tests that don't want log noise on stdout.
pub fn discard() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
