use tracing::{debug, error, info, warn};

/// Logging surface for messages that originate in translator code
pub trait TranslatorLogger: Send + Sync {
    /// Log a debug message
    fn debug(&self, message: &str);

    /// Log an info message
    fn info(&self, message: &str);

    /// Log a warning message
    fn warn(&self, message: &str);

    /// Log an error message
    fn error(&self, message: &str);
}

pub struct DefaultTranslatorLogger {
    translator: String,
}

impl DefaultTranslatorLogger {
    pub fn new(translator: String) -> Self {
        Self { translator }
    }
}

impl TranslatorLogger for DefaultTranslatorLogger {
    fn debug(&self, message: &str) {
        debug!(translator = %self.translator, "{}", message);
    }
    fn info(&self, message: &str) {
        info!(translator = %self.translator, "{}", message);
    }
    fn warn(&self, message: &str) {
        warn!(translator = %self.translator, "{}", message);
    }
    fn error(&self, message: &str) {
        error!(translator = %self.translator, "{}", message);
    }
}
