//! Thin wrapper over the ruff parser.
//!
//! Produces the ruff syntax tree consumed by both the validator's tree walk
//! and the lowering pass, plus a line table for mapping byte offsets back to
//! 1-based source lines.

use ruff_python_ast::ModModule;
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextRange};

/// A syntax error with a 1-based source line.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} at line {line}")]
pub struct SyntaxFault {
    pub message: String,
    pub line: u32,
}

/// Byte-offset → line-number table for one source string.
#[derive(Debug)]
pub(crate) struct LineIndex {
    /// Byte offset of the start of each line.
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(code: &str) -> Self {
        let mut starts = vec![0];
        for (offset, byte) in code.bytes().enumerate() {
            if byte == b'\n' {
                starts.push(offset + 1);
            }
        }
        Self { starts }
    }

    /// 1-based line containing the given byte offset.
    pub fn line_of(&self, offset: usize) -> u32 {
        let line = match self.starts.binary_search(&offset) {
            Ok(index) => index,
            Err(index) => index - 1,
        };
        u32::try_from(line + 1).unwrap_or(u32::MAX)
    }

    /// 1-based line of a range's start.
    pub fn line_of_range(&self, range: TextRange) -> u32 {
        self.line_of(range.start().to_usize())
    }
}

/// Parses a module, mapping parse failures to a line-tagged syntax error.
pub(crate) fn parse(code: &str, index: &LineIndex) -> Result<ModModule, SyntaxFault> {
    let parsed = parse_module(code).map_err(|e| SyntaxFault {
        message: e.to_string(),
        line: index.line_of_range(e.range()),
    })?;
    Ok(parsed.into_syntax())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_index_maps_offsets() {
        let index = LineIndex::new("ab\ncd\ne");
        assert_eq!(index.line_of(0), 1);
        assert_eq!(index.line_of(2), 1);
        assert_eq!(index.line_of(3), 2);
        assert_eq!(index.line_of(6), 3);
    }

    #[test]
    fn parse_ok_and_syntax_error() {
        let code = "x = 1\ny = (";
        let index = LineIndex::new(code);
        assert!(parse("x = 1", &LineIndex::new("x = 1")).is_ok());
        let err = parse(code, &index).unwrap_err();
        assert_eq!(err.line, 2);
    }
}
