use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::output::Output;

/// Formatter that renders tracing events as bare session-log lines; the
/// elapsed-time and prefix columns are added by [`Output`] itself.
struct SessionLogFormatter;

impl<S, N> FormatEvent<S, N> for SessionLogFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let level = *event.metadata().level();
        if level <= Level::WARN {
            write!(writer, "{} ", level)?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

struct OutputWriter(Arc<Output>);

impl std::io::Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write("TEL", &String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Route `tracing` events from all crates into the session log.
pub fn init_logging(output: Arc<Output>, verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default.parse().expect("static directive parses"))
        .from_env_lossy();
    let layer = tracing_subscriber::fmt::layer()
        .event_format(SessionLogFormatter)
        .with_writer(move || OutputWriter(output.clone()));
    tracing_subscriber::registry().with(env_filter).with(layer).init();
}
