//! # Compiler Diagnostics
//!
//! Structured messages produced by a compile pass. Every diagnostic goes
//! through a [`DiagnosticSink`]; the compile fails if any of them has
//! [`Severity::Error`].

use std::fmt;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compiler message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,

    /// Source file the message refers to
    pub source_path: String,

    /// 1-based line, when known
    pub line: Option<usize>,

    /// 1-based column, when known
    pub column: Option<usize>,

    pub message: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, source_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            source_path: source_path.into(),
            line: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn error(source_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, source_path, message)
    }

    pub fn warning(source_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, source_path, message)
    }

    pub fn note(source_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Note, source_path, message)
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// `path:line:col` or just the path
    pub fn location(&self) -> String {
        match (self.line, self.column) {
            (Some(line), Some(column)) => format!("{}:{}:{}", self.source_path, line, column),
            (Some(line), None) => format!("{}:{}", self.source_path, line),
            _ => self.source_path.clone(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.location(), self.severity, self.message)
    }
}

/// Receiver of compiler diagnostics
pub trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);
}

impl DiagnosticSink for Vec<Diagnostic> {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

/// Sink that forwards every diagnostic to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl DiagnosticSink for LoggingSink {
    fn report(&mut self, diagnostic: Diagnostic) {
        let location = diagnostic.location();
        match diagnostic.severity {
            Severity::Error => {
                tracing::error!(location = %location, "compilation error: {}", diagnostic.message)
            }
            Severity::Warning => {
                tracing::warn!(location = %location, "compilation warning: {}", diagnostic.message)
            }
            Severity::Note => {
                tracing::info!(location = %location, "compilation note: {}", diagnostic.message)
            }
        }
    }
}

/// Sink wrapper that counts errors on the way through
pub struct CountingSink<'a> {
    inner: &'a mut dyn DiagnosticSink,
    errors: usize,
}

impl<'a> CountingSink<'a> {
    pub fn new(inner: &'a mut dyn DiagnosticSink) -> Self {
        Self { inner, errors: 0 }
    }

    pub fn errors(&self) -> usize {
        self.errors
    }
}

impl DiagnosticSink for CountingSink<'_> {
    fn report(&mut self, diagnostic: Diagnostic) {
        if diagnostic.is_error() {
            self.errors += 1;
        }
        self.inner.report(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_position() {
        let d = Diagnostic::error("site/Main.wat", "unexpected token").at(3, 7);
        assert_eq!(d.to_string(), "site/Main.wat:3:7: error: unexpected token");
    }

    #[test]
    fn test_display_without_position() {
        let d = Diagnostic::warning("Main.wat", "no entry points");
        assert_eq!(d.to_string(), "Main.wat: warning: no entry points");
    }

    #[test]
    fn test_counting_sink() {
        let mut collected: Vec<Diagnostic> = Vec::new();
        let mut sink = CountingSink::new(&mut collected);
        sink.report(Diagnostic::note("a.wat", "fine"));
        sink.report(Diagnostic::error("a.wat", "broken"));
        sink.report(Diagnostic::error("b.wat", "broken too"));

        assert_eq!(sink.errors(), 2);
        assert_eq!(collected.len(), 3);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Note);
    }
}
