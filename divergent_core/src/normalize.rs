use serde::Deserialize;

pub const DEFAULT_FIELD_DELIMITER: char = '|';
pub const DEFAULT_FLOAT_PRECISION: usize = 10;

/// What to do with the order of result rows.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RowOrder {
    /// Rows must appear in the same order.
    #[default]
    Preserve,
    /// Rows are compared as a sorted multiset unless the statement asks for
    /// an explicit `ORDER BY`.
    SortUnlessOrdered,
}

/// Canonicalizes delimited result output so that formatting and float
/// representation noise does not register as a divergence.
///
/// Two outputs are considered equal iff their canonical forms are
/// byte-identical. The float precision is the tolerance: it decides where
/// PASS ends and LOGIC_BUG begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNormalizer {
    delimiter: char,
    float_precision: usize,
    row_order: RowOrder,
}

impl Default for OutputNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_FIELD_DELIMITER, DEFAULT_FLOAT_PRECISION)
    }
}

impl OutputNormalizer {
    pub fn new(delimiter: char, float_precision: usize) -> Self {
        Self {
            delimiter,
            float_precision,
            row_order: RowOrder::Preserve,
        }
    }

    pub fn with_row_order(mut self, row_order: RowOrder) -> Self {
        self.row_order = row_order;
        self
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    pub fn float_precision(&self) -> usize {
        self.float_precision
    }

    pub fn row_order(&self) -> RowOrder {
        self.row_order
    }

    /// Canonical form of `raw`, rows kept in their original order.
    pub fn normalize(&self, raw: &str) -> String {
        self.canonical_rows(raw).join("\n")
    }

    /// Canonical form of `raw` produced by `statement`, applying the row-order policy.
    pub fn normalize_for(&self, raw: &str, statement: &str) -> String {
        let mut rows = self.canonical_rows(raw);
        if self.row_order == RowOrder::SortUnlessOrdered && !has_order_by(statement) {
            rows.sort_unstable();
        }
        rows.join("\n")
    }

    fn canonical_rows(&self, raw: &str) -> Vec<String> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| self.normalize_line(line))
            .collect()
    }

    fn normalize_line(&self, line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        for (i, field) in line.split(self.delimiter).enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            self.push_field(&mut out, field.trim());
        }
        out
    }

    fn push_field(&self, out: &mut String, field: &str) {
        // Integer-looking fields stay verbatim so that 1 vs 1.0 still differs.
        if field.contains('.') {
            if let Ok(value) = field.parse::<f64>() {
                out.push_str(&format!("{value:.prec$}", prec = self.float_precision));
                return;
            }
        }
        out.push_str(field);
    }
}

/// Whether `statement` has an `ORDER BY` outside literals, quoted names and comments.
fn has_order_by(statement: &str) -> bool {
    let lowered = blank_quoted_and_comments(statement).to_ascii_lowercase();
    let mut words = lowered.split_whitespace();
    while let Some(word) = words.next() {
        if word == "order" && words.clone().next().is_some_and(|next| next.starts_with("by")) {
            return true;
        }
    }
    false
}

/// Replaces every string literal, quoted identifier and comment with a space.
fn blank_quoted_and_comments(statement: &str) -> String {
    let mut out = String::with_capacity(statement.len());
    let mut chars = statement.chars().peekable();
    while let Some(c) = chars.next() {
        let close = match c {
            '\'' | '"' | '`' => c,
            '[' => ']',
            '-' if chars.peek() == Some(&'-') => '\n',
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
                continue;
            }
            _ => {
                out.push(c);
                continue;
            }
        };
        // An unterminated span runs to the end of the statement.
        for c in chars.by_ref() {
            if c == close {
                break;
            }
        }
        out.push(' ');
    }
    out
}
