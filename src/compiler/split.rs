//! # Module Splitting
//!
//! A handler source normally holds one module. When its top level is a
//! sequence of two or more `(module …)` forms, each form is compiled as a
//! module of its own. Anything else is handed to the compiler untouched.

/// One module's text inside a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource<'a> {
    /// Module identifier without the `$`, when declared
    pub id: Option<String>,

    pub text: &'a str,

    /// 1-based line where `text` starts in the file
    pub line: usize,

    /// 1-based column where `text` starts in the file
    pub column: usize,
}

impl ModuleSource<'_> {
    /// Translate a position inside `text` to a position inside the file
    pub fn remap(&self, line: usize, column: usize) -> (usize, usize) {
        if line <= 1 {
            (self.line, self.column + column.saturating_sub(1))
        } else {
            (self.line + line - 1, column)
        }
    }
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn bump(&mut self) {
        let Some(b) = self.peek() else { return };
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else if b & 0xC0 != 0x80 {
            // UTF-8 continuation bytes don't start a new column
            self.column += 1;
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.bump();
        }
    }

    /// Skip a nestable `(; … ;)` comment; false if it never closes
    fn skip_block_comment(&mut self) -> bool {
        self.bump();
        self.bump();
        let mut nesting = 1;
        while nesting > 0 {
            match (self.peek(), self.peek_at(1)) {
                (Some(b'('), Some(b';')) => {
                    nesting += 1;
                    self.bump();
                    self.bump();
                }
                (Some(b';'), Some(b')')) => {
                    nesting -= 1;
                    self.bump();
                    self.bump();
                }
                (Some(_), _) => self.bump(),
                (None, _) => return false,
            }
        }
        true
    }

    /// Skip a string literal; false if it never closes
    fn skip_string(&mut self) -> bool {
        self.bump();
        loop {
            match self.peek() {
                None => return false,
                Some(b'\\') => {
                    self.bump();
                    self.bump();
                }
                Some(b'"') => {
                    self.bump();
                    return true;
                }
                Some(_) => self.bump(),
            }
        }
    }
}

/// Top-level forms as `(start, end, line, column)`; `None` when the text
/// has bare tokens at the top level or is unbalanced
fn top_level_forms(text: &str) -> Option<Vec<(usize, usize, usize, usize)>> {
    let mut scanner = Scanner::new(text);
    let mut forms = Vec::new();
    let mut depth = 0usize;
    let mut start = None;

    while let Some(b) = scanner.peek() {
        match b {
            b';' if scanner.peek_at(1) == Some(b';') => scanner.skip_line_comment(),
            b'(' if scanner.peek_at(1) == Some(b';') => {
                if !scanner.skip_block_comment() {
                    return None;
                }
            }
            b'"' => {
                if depth == 0 || !scanner.skip_string() {
                    return None;
                }
            }
            b'(' => {
                if depth == 0 {
                    start = Some((scanner.pos, scanner.line, scanner.column));
                }
                depth += 1;
                scanner.bump();
            }
            b')' => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                scanner.bump();
                if depth == 0 {
                    let (pos, line, column) = start.take()?;
                    forms.push((pos, scanner.pos, line, column));
                }
            }
            b if b.is_ascii_whitespace() => scanner.bump(),
            _ => {
                if depth == 0 {
                    return None;
                }
                scanner.bump();
            }
        }
    }

    if depth != 0 {
        return None;
    }
    Some(forms)
}

fn module_id(after_keyword: &str) -> Option<String> {
    let id = after_keyword.trim_start().strip_prefix('$')?;
    let id = id
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .next()
        .unwrap_or("");
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Split a handler source into the modules it declares
pub fn split_modules(text: &str) -> Vec<ModuleSource<'_>> {
    let whole = || {
        vec![ModuleSource {
            id: None,
            text,
            line: 1,
            column: 1,
        }]
    };

    let forms = match top_level_forms(text) {
        Some(forms) if forms.len() >= 2 => forms,
        _ => return whole(),
    };

    let mut modules = Vec::with_capacity(forms.len());
    for (start, end, line, column) in forms {
        let form = &text[start..end];
        let Some(rest) = form.strip_prefix("(module") else {
            return whole();
        };
        if !rest.starts_with(|c: char| c.is_whitespace() || c == '(' || c == ')') {
            return whole();
        }
        modules.push(ModuleSource {
            id: module_id(rest),
            text: form,
            line,
            column,
        });
    }
    modules
}
