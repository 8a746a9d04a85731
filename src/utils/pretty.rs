//! Formatting utilities for printed IR and generated code.

/// A simple code formatter for generated code.
#[derive(Debug)]
pub struct CodeFormatter {
    output: String,
    indent_level: usize,
    indent_str: String,
    at_line_start: bool,
}

impl CodeFormatter {
    /// Create a new formatter with the given indent string.
    pub fn new(indent_str: &str) -> Self {
        Self {
            output: String::new(),
            indent_level: 0,
            indent_str: indent_str.to_string(),
            at_line_start: true,
        }
    }

    /// Create a formatter with default settings (2 spaces).
    pub fn default_indent() -> Self {
        Self::new("  ")
    }

    /// Increase indentation level.
    pub fn indent(&mut self) {
        self.indent_level += 1;
    }

    /// Decrease indentation level.
    pub fn dedent(&mut self) {
        if self.indent_level > 0 {
            self.indent_level -= 1;
        }
    }

    /// Write text.
    pub fn write(&mut self, s: &str) {
        for c in s.chars() {
            if c == '\n' {
                self.output.push('\n');
                self.at_line_start = true;
            } else {
                if self.at_line_start {
                    for _ in 0..self.indent_level {
                        self.output.push_str(&self.indent_str);
                    }
                    self.at_line_start = false;
                }
                self.output.push(c);
            }
        }
    }

    /// Write a full line.
    pub fn writeln(&mut self, s: &str) {
        self.write(s);
        self.write("\n");
    }

    /// Consume the formatter and return the output.
    pub fn finish(self) -> String {
        self.output
    }
}

/// Trim leading/trailing whitespace from every line and drop empty edges.
/// Used to make generated-source comparisons insensitive to trailing newlines.
pub fn trim_lines(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatter_indentation() {
        let mut f = CodeFormatter::default_indent();
        f.writeln("a {");
        f.indent();
        f.writeln("b");
        f.dedent();
        f.writeln("}");
        assert_eq!(f.finish(), "a {\n  b\n}\n");
    }

    #[test]
    fn test_trim_lines() {
        assert_eq!(trim_lines("\nvoid f() {}\n\n"), "void f() {}");
        assert_eq!(trim_lines("a {\n  b  \n}\n"), "a {\nb\n}");
    }
}
