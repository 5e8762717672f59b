use chrono::Local;
use nu_ansi_term::{Color, Style};
use std::fmt;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    prelude::*,
    registry::LookupSpan,
    Layer,
};

/// Target under which every terminal mint outcome is logged.
pub const MINT_RESULT_TARGET: &str = "mint_result";

/// Console shows mint outcomes and errors; the hourly file under `log_dir`
/// also keeps phase store and worker activity.
pub fn setup_logger(log_dir: &str) -> Option<WorkerGuard> {
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::hourly(log_dir, "drop");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = tracing_subscriber::filter::Targets::new()
        .with_target(MINT_RESULT_TARGET, tracing::Level::INFO)
        .with_target("drop_core", tracing::Level::INFO)
        .with_target("evm_drop", tracing::Level::INFO)
        .with_default(tracing::Level::WARN);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter)
        .with_filter(file_filter);

    let console_filter = tracing_subscriber::filter::Targets::new()
        .with_target(MINT_RESULT_TARGET, tracing::Level::INFO)
        .with_target("evm_drop", tracing::Level::INFO)
        .with_default(tracing::Level::ERROR);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(TerminalFormatter)
        .with_filter(console_filter);

    if tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_err()
    {
        // A subscriber is already installed (tests, embedding apps).
        return None;
    }

    Some(guard)
}

// --- Formatters ---

/// Fields of one event: the message, the `outcome` label mint results carry,
/// and every other field in recording order.
#[derive(Debug, Default)]
struct EventFields {
    message: String,
    outcome: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl EventFields {
    fn of(event: &Event<'_>) -> Self {
        let mut fields = Self::default();
        event.record(&mut fields);
        fields
    }

    fn put(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "outcome" => self.outcome = Some(value),
            _ => self.extra.push((name, value)),
        }
    }

    /// `message | key=value | ...`, with the outcome label in front when
    /// present.
    fn line(&self, ansi: bool) -> String {
        let mut line = String::new();
        if let Some(outcome) = &self.outcome {
            let label = format!("{:<7}", outcome);
            if ansi {
                let color = if outcome == "SUCCESS" {
                    Color::LightGreen
                } else {
                    Color::LightRed
                };
                line.push_str(&Style::new().fg(color).bold().paint(label).to_string());
            } else {
                line.push_str(&label);
            }
            line.push(' ');
        }
        line.push_str(&self.message);
        for (name, value) in &self.extra {
            line.push_str(&format!(" | {}={}", name, value));
        }
        line
    }
}

impl tracing::field::Visit for EventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.put(field.name(), format!("{:?}", value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.put(field.name(), value.to_string());
    }
}

/// Short clock, outcome-coloured mint results, yellow or red warnings.
pub struct TerminalFormatter;

impl<S, N> FormatEvent<S, N> for TerminalFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let fields = EventFields::of(event);
        let time = Style::new()
            .dimmed()
            .paint(Local::now().format("%H:%M:%S").to_string());

        let level = *event.metadata().level();
        let line = fields.line(true);
        if fields.outcome.is_none() && level <= tracing::Level::WARN {
            let color = if level == tracing::Level::ERROR {
                Color::LightRed
            } else {
                Color::Yellow
            };
            writeln!(writer, "{} {}", time, Style::new().fg(color).paint(line))
        } else {
            writeln!(writer, "{} {}", time, line)
        }
    }
}

/// Full timestamp, level, target and the enclosing spans (for instance
/// `mint{id=7}`) so a request can be followed through the file.
pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
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
        write!(
            writer,
            "{} [{}] {}: ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            meta.level(),
            meta.target()
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                write!(writer, " ")?;
            }
        }

        writeln!(writer, "{}", EventFields::of(event).line(false))
    }
}
