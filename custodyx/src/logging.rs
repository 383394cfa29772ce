use crate::Opts;
use tracing::level_filters::LevelFilter;

/// Maps `-v`/`-q` occurrences to a level. INFO by default; each `-v` goes one
/// level finer, each `-q` one coarser, and past ERROR logging is off.
fn level_filter(verbose: u8, quiet: u8) -> LevelFilter {
    match i16::from(verbose) - i16::from(quiet) {
        x if x >= 2 => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        0 => LevelFilter::INFO,
        -1 => LevelFilter::WARN,
        -2 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

pub(crate) fn setup_logging(opts: &Opts) {
    let level = level_filter(opts.verbose, opts.quiet);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!(version = clap::crate_version!(), %level, "logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_moves_the_level() {
        assert_eq!(level_filter(0, 0), LevelFilter::INFO);
        assert_eq!(level_filter(1, 0), LevelFilter::DEBUG);
        assert_eq!(level_filter(5, 0), LevelFilter::TRACE);
        assert_eq!(level_filter(0, 1), LevelFilter::WARN);
        assert_eq!(level_filter(1, 3), LevelFilter::ERROR);
        assert_eq!(level_filter(0, 3), LevelFilter::OFF);
    }
}
