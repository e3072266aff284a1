use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceLevel {
    Debug,
    Trace,
    System,
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceLevel::Debug => "DEBUG",
            TraceLevel::Trace => "TRACE",
            TraceLevel::System => "SYSTEM",
        })
    }
}

pub type TraceCallback = Arc<dyn Fn(TraceLevel, &str) + Send + Sync>;

/// Execution trace sink. Everything goes to the `log` facade at debug level; when a callback is
/// attached (e.g. for a `debug_trace` style request) the prefixed message is forwarded as well.
#[derive(Clone, Default)]
pub struct TraceLogger {
    prefix: String,
    on_log: Option<TraceCallback>,
}

impl TraceLogger {
    pub fn new(on_log: Option<TraceCallback>) -> Self {
        Self {
            prefix: String::new(),
            on_log,
        }
    }

    pub fn is_trace(&self) -> bool {
        self.on_log.is_some()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            on_log: self.on_log.clone(),
        }
    }

    pub fn tlog(&self, lv: TraceLevel, args: fmt::Arguments<'_>) {
        if log::log_enabled!(log::Level::Debug) || self.on_log.is_some() {
            let msg = format!("{}{}", self.prefix, args);
            log::debug!("[{}] {}", lv, msg);
            if let Some(cb) = &self.on_log {
                cb(lv, &msg)
            }
        }
    }

    pub fn tdebug(&self, args: fmt::Arguments<'_>) {
        self.tlog(TraceLevel::Debug, args)
    }

    pub fn ttrace(&self, args: fmt::Arguments<'_>) {
        self.tlog(TraceLevel::Trace, args)
    }

    pub fn tsystem(&self, args: fmt::Arguments<'_>) {
        self.tlog(TraceLevel::System, args)
    }
}

impl fmt::Debug for TraceLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceLogger")
            .field("prefix", &self.prefix)
            .field("is_trace", &self.is_trace())
            .finish()
    }
}

#[test]
fn test_trace_callback_gets_prefixed_messages() {
    use parking_lot::Mutex;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let logger = TraceLogger::new(Some(Arc::new(move |lv, msg: &str| {
        sink.lock().push((lv, msg.to_string()))
    })));
    let logger = logger.with_prefix("tx[0] ");
    logger.tsystem(format_args!("transfer {}", 10));
    logger.tdebug(format_args!("done"));
    assert_eq!(
        &*seen.lock(),
        &[
            (TraceLevel::System, "tx[0] transfer 10".to_string()),
            (TraceLevel::Debug, "tx[0] done".to_string()),
        ]
    );
    assert!(!TraceLogger::default().is_trace());
}
