use std::path::PathBuf;
use std::str::FromStr;

use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand};

use delocate_core::SignerKind;
use delocate_platform::{Arch, BinaryFormat, MacOSVersion, PlatformTag};
use delocate_static::EnvVars;

// Configures Clap v3-style help menu colors
const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Parser)]
#[command(name = "delocate", author, version)]
#[command(about = "Make macOS Python wheels self-contained.")]
#[command(propagate_version = true)]
#[command(styles = STYLES)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global_args: GlobalArgs,
}

#[derive(Parser, Debug, Clone)]
#[command(next_help_heading = "Global options")]
pub struct GlobalArgs {
    /// Do not print any output.
    #[arg(global = true, long, short, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Use verbose output.
    ///
    /// Repeat for more detail (`-vv`). You can configure fine-grained logging using the
    /// `RUST_LOG` environment variable.
    /// (<https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives>)
    #[arg(global = true, action = clap::ArgAction::Count, long, short, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Control colors in output.
    #[arg(
        global = true,
        long,
        value_enum,
        default_value = "auto",
        value_name = "COLOR_CHOICE"
    )]
    pub color: ColorChoice,
}

#[derive(Debug, Copy, Clone, clap::ValueEnum)]
pub enum ColorChoice {
    /// Enables colored output only when the output is going to a terminal or TTY with support.
    Auto,

    /// Enables colored output regardless of the detected environment.
    Always,

    /// Disables colored output.
    Never,
}

impl From<ColorChoice> for anstream::ColorChoice {
    fn from(value: ColorChoice) -> Self {
        match value {
            ColorChoice::Auto => Self::Auto,
            ColorChoice::Always => Self::Always,
            ColorChoice::Never => Self::Never,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy the external libraries of wheels into them, and repoint their binaries at the copies.
    Wheel(WheelArgs),

    /// Delocate directory trees in place.
    Path(PathArgs),

    /// List the libraries that wheels or directories depend on.
    ListDeps(ListDepsArgs),

    /// Fuse two wheels built for different architectures into one.
    ///
    /// Binaries present in both wheels are merged into universal binaries.
    Fuse(FuseArgs),

    /// Edit the install id, dependencies, or rpaths of a single Mach-O binary.
    PatchBinary(PatchBinaryArgs),

    /// Add platform tags to the filename and `WHEEL` metadata of wheels.
    AddPlatforms(AddPlatformsArgs),
}

/// Options shared by the commands that copy libraries into a package.
#[derive(Args, Debug, Clone)]
pub struct DelocateArgs {
    /// Subdirectory of the package in which to store copied libraries.
    #[arg(long, short = 'L', default_value = ".dylibs", value_name = "LIB_SDIR")]
    pub lib_sdir: String,

    /// Only inspect files ending in `.so` or `.dylib`.
    ///
    /// By default, every file is checked for a Mach-O header.
    #[arg(long, short = 'd')]
    pub dylibs_only: bool,

    /// Exclude libraries whose install name contains the given pattern.
    ///
    /// May be provided multiple times.
    #[arg(long, short = 'e', value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Exclude libraries installed under the given path prefix.
    ///
    /// `/usr/lib` and `/System` are always excluded. May be provided multiple times, or as a
    /// colon-separated list in the environment.
    #[arg(
        long = "exclude-prefix",
        env = EnvVars::DELOCATE_EXCLUDE_PREFIXES,
        value_delimiter = ':',
        value_name = "PATH"
    )]
    pub exclude_prefixes: Vec<PathBuf>,

    /// Keep absolute rpaths in the package's binaries.
    ///
    /// By default, rpaths that do not start with `@` are removed, since they point into the build
    /// environment.
    #[arg(long)]
    pub no_sanitize_rpaths: bool,

    /// How to re-sign binaries that carried a code signature before they were edited.
    #[arg(long, default_value_t = SignerKind::Adhoc, value_name = "SIGNER")]
    pub signer: SignerKind,
}

#[derive(Args, Debug, Clone)]
pub struct WheelArgs {
    /// The wheels to delocate.
    #[arg(required = true, value_name = "WHEEL")]
    pub wheels: Vec<PathBuf>,

    /// Directory in which to write delocated wheels.
    ///
    /// By default, the input wheels are overwritten.
    #[arg(long, short = 'w', value_name = "WHEEL_DIR")]
    pub wheel_dir: Option<PathBuf>,

    #[command(flatten)]
    pub delocate: DelocateArgs,

    /// Check that every library provides the architectures of the binaries that load it.
    #[arg(long, short = 'k')]
    pub check_archs: bool,

    /// Architectures that every binary must provide.
    ///
    /// Either a comma-separated list (e.g., `x86_64,arm64`), or a multi-architecture name such as
    /// `intel` or `universal2`.
    #[arg(long, value_name = "ARCHS")]
    pub require_archs: Option<RequiredArchs>,

    /// Fail if a copied library requires a newer macOS than the given version.
    ///
    /// By default, the wheel's platform tag is raised to the newest version any binary requires.
    #[arg(
        long,
        env = EnvVars::MACOSX_DEPLOYMENT_TARGET,
        value_parser = parse_macos_version,
        value_name = "VERSION"
    )]
    pub require_target_macos_version: Option<MacOSVersion>,
}

#[derive(Args, Debug, Clone)]
pub struct PathArgs {
    /// The directories to delocate.
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    #[command(flatten)]
    pub delocate: DelocateArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ListDepsArgs {
    /// Wheels or directories to inspect.
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Include libraries that are excluded from delocating, such as system libraries.
    #[arg(long, short = 'a')]
    pub all: bool,

    /// Show the binaries that depend on each library.
    #[arg(long, short = 'd')]
    pub depending: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FuseArgs {
    /// The wheel to fuse into.
    pub to_wheel: PathBuf,

    /// The wheel to fuse from.
    pub from_wheel: PathBuf,

    /// Directory in which to write the fused wheel.
    ///
    /// The fused wheel is named after `TO_WHEEL` with the platform tags of both wheels. By
    /// default, it replaces `TO_WHEEL`.
    #[arg(long, short = 'w', value_name = "WHEEL_DIR")]
    pub wheel_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct PatchBinaryArgs {
    /// The Mach-O binary to edit.
    pub file: PathBuf,

    /// Set the install id of a dynamic library.
    #[arg(long, value_name = "ID")]
    pub id: Option<String>,

    /// Replace a dependency install name.
    ///
    /// May be provided multiple times.
    #[arg(long, num_args = 2, value_names = ["OLD", "NEW"], action = clap::ArgAction::Append)]
    pub change: Vec<String>,

    /// Add an rpath.
    #[arg(long, value_name = "PATH")]
    pub add_rpath: Vec<String>,

    /// Delete an rpath.
    #[arg(long, value_name = "PATH")]
    pub delete_rpath: Vec<String>,

    /// How to re-sign the binary after editing it.
    #[arg(long, default_value_t = SignerKind::Adhoc, value_name = "SIGNER")]
    pub signer: SignerKind,
}

#[derive(Args, Debug, Clone)]
pub struct AddPlatformsArgs {
    /// The wheels to modify.
    #[arg(required = true, value_name = "WHEEL")]
    pub wheels: Vec<PathBuf>,

    /// Platform tag to add (e.g., `macosx_10_9_intel`).
    ///
    /// May be provided multiple times.
    #[arg(long, short = 'p', value_name = "PLATFORM_TAG")]
    pub plat_tag: Vec<PlatformTag>,

    /// Add the platform tags for a macOS version (e.g., `10_9`).
    ///
    /// Adds `macosx_<VERSION>_<DUAL_ARCH_TYPE>` and `macosx_<VERSION>_x86_64`. May be provided
    /// multiple times.
    #[arg(long, short = 'x', value_name = "OSX_VERSION")]
    pub osx_ver: Vec<String>,

    /// The multi-architecture binary format used by `--osx-ver`.
    #[arg(long, short = 'd', default_value = "intel", value_name = "ARCHITECTURE")]
    pub dual_arch_type: BinaryFormat,

    /// Directory in which to write the modified wheels.
    ///
    /// By default, wheels are written next to their input.
    #[arg(long, short = 'w', value_name = "WHEEL_DIR")]
    pub wheel_dir: Option<PathBuf>,

    /// Overwrite existing wheels.
    #[arg(long, short = 'c')]
    pub clobber: bool,

    /// Remove the input wheel when a renamed wheel is written.
    #[arg(long, short = 'r')]
    pub rm_orig: bool,

    /// Skip wheels that cannot be modified (e.g., pure Python wheels) instead of failing.
    #[arg(long, short = 'k')]
    pub skip_errors: bool,
}

impl AddPlatformsArgs {
    /// The tags to add: those given directly, then those derived from each `--osx-ver`.
    pub fn platform_tags(&self) -> Result<Vec<PlatformTag>, delocate_platform::Error> {
        let mut tags = self.plat_tag.clone();
        for version in &self.osx_ver {
            let version = version.replace('.', "_");
            for binary_format in [self.dual_arch_type, BinaryFormat::X86_64] {
                let tag = PlatformTag::from_str(&format!("macosx_{version}_{binary_format}"))?;
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        Ok(tags)
    }
}

/// A set of required architectures, e.g., `x86_64,arm64` or `universal2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredArchs(pub Vec<Arch>);

impl FromStr for RequiredArchs {
    type Err = delocate_platform::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Arch::parse_list(s).map(Self)
    }
}

fn parse_macos_version(input: &str) -> Result<MacOSVersion, String> {
    MacOSVersion::parse(input).ok_or_else(|| format!("`{input}` is not a valid macOS version"))
}
