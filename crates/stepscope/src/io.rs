//! Replacement I/O for the restricted guest environment.
//!
//! Guest code never touches host stdio. `print` writes into a
//! [`StdoutBuffer`] that the trace collector drains between steps, and
//! `input` reads from a pre-supplied, bounded list of lines.

/// Accumulates guest stdout between trace steps.
///
/// The collector takes the pending delta at every step; the sum of all
/// deltas is the execution's final stdout.
#[derive(Debug, Default)]
pub struct StdoutBuffer {
    pending: String,
}

impl StdoutBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends text to the pending delta.
    pub fn push_str(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    /// Appends a single character to the pending delta.
    pub fn push(&mut self, ch: char) {
        self.pending.push(ch);
    }

    /// Takes everything written since the last call, leaving the buffer
    /// empty.
    pub fn take_delta(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Returns true if nothing has been written since the last drain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Scripted replacement for interactive standard input.
///
/// Each call to the guest's `input()` consumes the next line. When the
/// script is exhausted, `input()` returns the empty string; it never blocks.
#[derive(Debug)]
pub struct ScriptedInput {
    lines: Vec<String>,
    index: usize,
}

impl ScriptedInput {
    /// Splits the raw input string into lines.
    ///
    /// An empty string scripts zero lines, not one empty line.
    #[must_use]
    pub fn new(input: &str) -> Self {
        let lines = if input.is_empty() {
            Vec::new()
        } else {
            input.split('\n').map(str::to_owned).collect()
        };
        Self { lines, index: 0 }
    }

    /// Consumes and returns the next scripted line, if any remain.
    pub fn next_line(&mut self) -> Option<String> {
        let line = self.lines.get(self.index).cloned()?;
        self.index += 1;
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_sum_to_total() {
        let mut buffer = StdoutBuffer::new();
        buffer.push_str("a");
        let first = buffer.take_delta();
        buffer.push_str("bc");
        buffer.push('\n');
        let second = buffer.take_delta();
        assert_eq!(first, "a");
        assert_eq!(second, "bc\n");
        assert!(buffer.is_empty());
    }

    #[test]
    fn scripted_input_exhaustion() {
        let mut input = ScriptedInput::new("one\ntwo");
        assert_eq!(input.next_line().as_deref(), Some("one"));
        assert_eq!(input.next_line().as_deref(), Some("two"));
        assert_eq!(input.next_line(), None);
    }

    #[test]
    fn empty_input_scripts_nothing() {
        let mut input = ScriptedInput::new("");
        assert_eq!(input.next_line(), None);
    }
}
