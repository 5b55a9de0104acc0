//! Secret redaction for log output.
//!
//! Collaborator errors and config dumps can carry bearer tokens or API keys.
//! [`RedactingWriter`] wraps the subscriber's writer and scrubs every
//! formatted line before it reaches stderr.

use std::borrow::Cow;
use std::io::{self, Write};
use std::sync::Arc;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

/// Replacement text for a redacted value.
pub const REDACTED: &str = "***REDACTED***";

/// Compiled secret patterns.
#[derive(Debug)]
pub struct Redactor {
    assignments: Regex,
    bearer: Regex,
}

impl Redactor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // key=value, "key":"value" and key: Some("value")
            assignments: Regex::new(
                r#"(?i)(api[_-]?key|token|password|secret)(["']?\s*[:=]\s*(?:Some\()?["']?)[^\s"',)&]+"#,
            )?,
            bearer: Regex::new(r"(?i)(bearer\s+)[\w\-.~+/=]+")?,
        })
    }

    /// `text` with every secret value replaced by [`REDACTED`].
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let replaced = self.assignments.replace_all(text, format!("${{1}}${{2}}{REDACTED}").as_str());
        if !self.bearer.is_match(&replaced) {
            return replaced;
        }
        let cleaned = self
            .bearer
            .replace_all(&replaced, format!("${{1}}{REDACTED}").as_str())
            .into_owned();
        Cow::Owned(cleaned)
    }
}

/// A [`MakeWriter`] that redacts each event before handing it to `inner`.
#[derive(Clone)]
pub struct RedactingWriter<M> {
    inner: M,
    redactor: Arc<Redactor>,
}

impl<M> RedactingWriter<M> {
    pub fn new(inner: M, redactor: Arc<Redactor>) -> Self {
        Self { inner, redactor }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingWriter<M>
where
    M: MakeWriter<'a> + 'a,
{
    type Writer = RedactedEvent<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactedEvent {
            inner: self.inner.make_writer(),
            redactor: self.redactor.clone(),
            buf: Vec::new(),
        }
    }
}

/// Buffers one formatted event; redacts and forwards it on flush or drop.
pub struct RedactedEvent<W: Write> {
    inner: W,
    redactor: Arc<Redactor>,
    buf: Vec<u8>,
}

impl<W: Write> RedactedEvent<W> {
    fn emit(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        {
            let text = String::from_utf8_lossy(&self.buf);
            let clean = self.redactor.redact(&text);
            self.inner.write_all(clean.as_bytes())?;
        }
        self.buf.clear();
        Ok(())
    }
}

impl<W: Write> Write for RedactedEvent<W> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactedEvent<W> {
    fn drop(&mut self) {
        let _ = self.emit();
    }
}
