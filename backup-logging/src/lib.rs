use std::{
    collections::HashMap,
    env,
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, subscriber::Interest, Metadata, Subscriber};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{writer::BoxMakeWriter, MakeWriter},
    layer::{Context, Layer},
    prelude::*,
    registry,
    util::TryInitError,
    EnvFilter,
};

/// Name of the span field that carries the VM being processed.
pub const VM_FIELD: &str = "vm";

const DEFAULT_LOG_FILE: &str = "/var/log/vm-backup.log";

// --- Custom "Tee" Writer ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

// --- Per-VM filtering ---

/// Drops events emitted inside a `vm` span whose VM is not in the allow list.
///
/// Events outside any `vm` span (start-up, run summary) always pass.
pub struct VmFilterLayer {
    vms: Vec<String>,
}

impl VmFilterLayer {
    pub fn new(vms: Vec<String>) -> Self {
        Self { vms }
    }
}

impl<S> Layer<S> for VmFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn register_callsite(&self, metadata: &'static Metadata<'static>) -> Interest {
        if self.vms.is_empty() || metadata.is_span() {
            Interest::always()
        } else {
            // The decision depends on the current span, so ask per event.
            Interest::sometimes()
        }
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        let mut visitor = FieldVisitor(&mut fields);
        attrs.record(&mut visitor);
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.vms.is_empty() || meta.is_span() {
            return true;
        }

        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return true;
        };

        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                if let Some(vm) = fields.get(VM_FIELD) {
                    return self.vms.iter().any(|allowed| allowed == vm);
                }
            }
        }
        true
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

// --- Settings ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// Logging options gathered from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file_path: PathBuf,
    pub vms: Vec<String>,
}

impl LogSettings {
    pub fn from_env(debug: bool) -> Self {
        Self::from_lookup(debug, |key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. `debug` forces the
    /// level to `debug` regardless of `LOG_LEVEL`.
    pub fn from_lookup(debug: bool, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = if debug {
            "debug".to_string()
        } else {
            lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string())
        };
        let output = match lookup("LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            Some("console") => LogOutput::Console,
            Some("off") | Some("none") => LogOutput::Off,
            _ => LogOutput::Both,
        };
        let format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let file_path = lookup("LOG_FILE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
        let vms = lookup("LOG_VMS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            level,
            output,
            format,
            file_path,
            vms,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        for directive in ["duct=warn", "rayon=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

fn file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let log_dir = path.parent().unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vm-backup.log".to_string());
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_filename)
        .build(log_dir)?;
    Ok(tracing_appender::non_blocking(file_appender))
}

/// Initializes the global tracing subscriber.
///
/// The returned guard must be kept alive for the duration of the program when
/// file output is enabled, otherwise buffered lines are lost on exit.
///
/// A log file that cannot be opened downgrades file output to the console
/// and is reported as the first warning of the run.
pub fn init_subscriber(settings: &LogSettings) -> Result<Option<WorkerGuard>, TryInitError> {
    let subscriber = registry()
        .with(settings.env_filter())
        .with(VmFilterLayer::new(settings.vms.clone()));

    if settings.output == LogOutput::Off {
        subscriber.try_init()?;
        return Ok(None);
    }

    let wants_file = matches!(settings.output, LogOutput::File | LogOutput::Both);
    let (file, file_error) = if wants_file {
        match file_writer(&settings.file_path) {
            Ok(file) => (Some(file), None),
            Err(e) => (None, Some(e)),
        }
    } else {
        (None, None)
    };

    let (writer, guard, to_console) = match (settings.output, file) {
        (LogOutput::File, Some((non_blocking, guard))) => {
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        (LogOutput::Both, Some((non_blocking, guard))) => {
            let tee = MakeTee {
                make_a: io::stderr,
                make_b: non_blocking,
            };
            (BoxMakeWriter::new(tee), Some(guard), false)
        }
        _ => (BoxMakeWriter::new(io::stderr), None, true),
    };

    // ANSI only on an interactive console.
    let ansi = to_console && io::stderr().is_terminal();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false);
    match settings.format {
        LogFormat::Json => subscriber.with(fmt_layer.json()).try_init()?,
        LogFormat::Human => subscriber.with(fmt_layer.compact()).try_init()?,
    }

    if let Some(e) = file_error {
        tracing::warn!(
            path = %settings.file_path.display(),
            error = %e,
            "log file unavailable, logging to console only"
        );
    }
    Ok(guard)
}
