/// Declares all environment variable used throughout `delocate` and its crates.
pub struct EnvVars;

impl EnvVars {
    /// The minimum macOS version that delocated libraries may require.
    ///
    /// Equivalent to the `--require-target-macos-version` command-line argument. When unset, the
    /// version is taken from the wheel's platform tag.
    pub const MACOSX_DEPLOYMENT_TARGET: &'static str = "MACOSX_DEPLOYMENT_TARGET";

    /// Colon-separated directories searched for bare library names before the fallback paths.
    pub const DYLD_LIBRARY_PATH: &'static str = "DYLD_LIBRARY_PATH";

    /// Colon-separated directories searched for bare library names after `DYLD_LIBRARY_PATH`.
    pub const DYLD_FALLBACK_LIBRARY_PATH: &'static str = "DYLD_FALLBACK_LIBRARY_PATH";

    /// Colon-separated path prefixes that are never copied into a package, in addition to
    /// `/usr/lib` and `/System`.
    pub const DELOCATE_EXCLUDE_PREFIXES: &'static str = "DELOCATE_EXCLUDE_PREFIXES";

    /// Disables colored output (takes precedence over `FORCE_COLOR`).
    ///
    /// See [no-color.org](https://no-color.org).
    pub const NO_COLOR: &'static str = "NO_COLOR";

    /// Forces colored output regardless of terminal support.
    ///
    /// See [force-color.org](https://force-color.org).
    pub const FORCE_COLOR: &'static str = "FORCE_COLOR";

    /// If set, delocate will use this value as the log level for its `--verbose` output. Accepts
    /// any filter compatible with the `tracing_subscriber` crate.
    ///
    /// For example:
    ///
    /// * `RUST_LOG=delocate=debug` is the equivalent of adding `--verbose` to the command line
    /// * `RUST_LOG=trace` will enable trace-level logging.
    ///
    /// See the [tracing documentation](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax)
    /// for more.
    pub const RUST_LOG: &'static str = "RUST_LOG";
}
