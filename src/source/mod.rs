use crate::lexer::Span;

/// 1-based position of a diagnostic, plus the length of the offending
/// lexeme in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: i32,
    pub col: i32,
    pub length: i32,
}

/// Owns the source text of one compilation and renders diagnostics
/// against it.
pub struct SourceManager {
    pub source: String,
    pub path: String,
    line_starts: Vec<usize>,
}

impl SourceManager {
    pub fn new(source: impl Into<String>, path: impl Into<String>) -> Self {
        let source = source.into();
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        SourceManager { source, path: path.into(), line_starts }
    }

    /// Returns (line, col), both 1-based, for a byte offset.
    pub fn line_col(&self, offset: usize) -> (i32, i32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = offset.saturating_sub(self.line_starts[line]);
        (line as i32 + 1, col as i32 + 1)
    }

    pub fn location(&self, span: &Span) -> SourceLocation {
        let (line, col) = self.line_col(span.start);
        SourceLocation { line, col, length: span.len().max(1) as i32 }
    }

    /// 1-based line number of a byte offset, for instruction line fields.
    pub fn line_of(&self, offset: usize) -> i32 {
        self.line_col(offset).0
    }

    fn line_text(&self, line: i32) -> &str {
        if line < 1 || line as usize > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line as usize - 1];
        let end = self
            .line_starts
            .get(line as usize)
            .copied()
            .unwrap_or(self.source.len());
        self.source[start..end].trim_end_matches('\n').trim_end_matches('\r')
    }

    /// Renders a caret-underlined report. Kept separate from the printing
    /// side so tests can assert on the output.
    pub fn render(&self, title: &str, loc: SourceLocation, msg: &str, color: bool) -> String {
        let (red, yellow, reset) = if color {
            ("\x1b[1;31m", "\x1b[1;33m", "\x1b[0m")
        } else {
            ("", "", "")
        };
        let mut out = String::new();
        out.push_str(&format!("\n{red}{title}:{reset} {msg}\n"));
        if !self.path.is_empty() {
            out.push_str(&format!("    at {}\n", self.path));
        }
        if loc.line > 0 && (loc.line as usize) <= self.line_starts.len() {
            let code_line = self.line_text(loc.line).replace('\t', " ");
            out.push_str(&format!("    |\n{:>3} | {}\n    | ", loc.line, code_line));
            for _ in 1..loc.col {
                out.push(' ');
            }
            out.push_str(yellow);
            for _ in 0..loc.length.max(1) {
                out.push('^');
            }
            out.push_str(&format!(" {msg}{reset}\n    |\n"));
        }
        out
    }

    pub fn report(&self, title: &str, loc: SourceLocation, msg: &str) {
        eprint!("{}", self.render(title, loc, msg, use_color()));
    }
}

/// ANSI color on stderr only when it is a terminal and NO_COLOR is unset.
pub fn use_color() -> bool {
    // SAFETY: isatty is safe to call with any fd; it reports 0 for
    // non-terminals and on error.
    let is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) } != 0;
    is_tty && std::env::var_os("NO_COLOR").is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_single_line() {
        let sm = SourceManager::new("unit u {}", "");
        assert_eq!(sm.line_col(0), (1, 1));
        assert_eq!(sm.line_col(5), (1, 6));
    }

    #[test]
    fn line_col_multi_line() {
        let sm = SourceManager::new("ab\ncd\nef", "");
        assert_eq!(sm.line_col(0), (1, 1));
        assert_eq!(sm.line_col(3), (2, 1));
        assert_eq!(sm.line_col(7), (3, 2));
    }

    #[test]
    fn location_length_never_zero() {
        let sm = SourceManager::new("x", "");
        let loc = sm.location(&(1..1));
        assert_eq!(loc.length, 1);
    }

    #[test]
    fn render_contains_source_and_carets() {
        let sm = SourceManager::new("unit u {\n  bogus\n}", "demo.mon");
        let loc = SourceLocation { line: 2, col: 3, length: 5 };
        let out = sm.render("Compilation error", loc, "expected 'on <type> <func>'", false);
        assert!(out.contains("bogus"), "missing source line in:\n{out}");
        assert!(out.contains("^^^^^"), "missing carets in:\n{out}");
        assert!(out.contains("demo.mon"), "missing path in:\n{out}");
        assert!(!out.contains("\x1b["), "unexpected ANSI codes in:\n{out}");
    }

    #[test]
    fn render_with_color_has_ansi_codes() {
        let sm = SourceManager::new("x", "");
        let loc = SourceLocation { line: 1, col: 1, length: 1 };
        let out = sm.render("err", loc, "msg", true);
        assert!(out.contains("\x1b[1;31m"));
    }

    #[test]
    fn render_out_of_range_line_skips_snippet() {
        let sm = SourceManager::new("x", "");
        let loc = SourceLocation { line: 0, col: 0, length: 0 };
        let out = sm.render("err", loc, "no main", false);
        assert!(out.contains("no main"));
        assert!(!out.contains('^'));
    }
}
