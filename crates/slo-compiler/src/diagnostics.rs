//! diagnostics.rs — panic-mode error collection (§7).
//!
//! The parser does not stop at the first syntax error: it records the
//! error, synchronizes to the next statement boundary, and keeps parsing
//! so a single compile can surface several independent mistakes.

#[derive(Debug)]
pub struct Diag {
    pub line: u32,
    pub at: String,
    pub message: String,
}

impl std::fmt::Display for Diag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] Error at '{}': {}", self.line, self.at, self.message)
    }
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<Diag>,
    /// While true, new errors are swallowed — set after the first error
    /// in a run until the parser resynchronizes, so one bad token doesn't
    /// cascade into a dozen misleading follow-on errors.
    panicking: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, line: u32, at: impl Into<String>, message: impl Into<String>) {
        if self.panicking {
            return;
        }
        self.panicking = true;
        self.errors.push(Diag { line, at: at.into(), message: message.into() });
    }

    pub fn synchronized(&mut self) {
        self.panicking = false;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Diag] {
        &self.errors
    }

    pub fn render(&self) -> String {
        self.errors.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n")
    }
}
