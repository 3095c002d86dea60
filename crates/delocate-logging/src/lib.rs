//! Log line formatting for the `delocate` CLI.

use std::fmt::{self, Write};

use jiff::Timestamp;
use owo_colors::OwoColorize;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// The style of a delocate logging line, e.g., `DEBUG delocate_core::resolve: Excluded libz`.
#[derive(Debug, Clone, Copy)]
pub struct DelocateFormat {
    /// Prefix each line with the current time.
    pub display_timestamp: bool,
    /// Prefix each line with the (colored) level.
    pub display_level: bool,
    /// Prefix each line with the module that emitted it.
    pub display_target: bool,
    /// Prefix each line with the names of the enclosing spans, outermost first.
    pub show_spans: bool,
}

impl Default for DelocateFormat {
    fn default() -> Self {
        Self {
            display_timestamp: false,
            display_level: true,
            display_target: false,
            show_spans: false,
        }
    }
}

impl DelocateFormat {
    /// The format used for `--verbose` output.
    pub fn verbose() -> Self {
        Self {
            display_target: true,
            show_spans: true,
            ..Self::default()
        }
    }
}

fn write_level(writer: &mut Writer<'_>, level: Level, ansi: bool) -> fmt::Result {
    if !ansi {
        return write!(writer, "{level} ");
    }
    // Same colors as tracing
    match level {
        Level::TRACE => write!(writer, "{} ", level.purple()),
        Level::DEBUG => write!(writer, "{} ", level.blue()),
        Level::INFO => write!(writer, "{} ", level.green()),
        Level::WARN => write!(writer, "{} ", level.yellow()),
        Level::ERROR => write!(writer, "{} ", level.red()),
    }
}

/// See <https://docs.rs/tracing-subscriber/0.3.18/src/tracing_subscriber/fmt/format/mod.rs.html#1026-1156>
impl<S, N> FormatEvent<S, N> for DelocateFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let ansi = writer.has_ansi_escapes();

        if self.display_timestamp {
            let now = Timestamp::now();
            if ansi {
                write!(writer, "{} ", now.dimmed())?;
            } else {
                write!(writer, "{now} ")?;
            }
        }

        if self.display_level {
            write_level(&mut writer, *meta.level(), ansi)?;
        }

        if self.display_target {
            let target = meta.target();
            if ansi {
                write!(writer, "{}: ", target.dimmed())?;
            } else {
                write!(writer, "{target}: ")?;
            }
        }

        if self.show_spans {
            let scope = event
                .parent()
                .and_then(|id| ctx.span(id))
                .or_else(|| ctx.lookup_current())
                .into_iter()
                .flat_map(|span| span.scope().from_root());

            let mut names = String::new();
            for span in scope {
                if ansi {
                    write!(names, "{}:", span.metadata().name().bold())?;
                } else {
                    write!(names, "{}:", span.metadata().name())?;
                }
            }
            if !names.is_empty() {
                write!(writer, "{names} ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}
