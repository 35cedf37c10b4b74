//! Relaxed JSON grammar of Spring Data query templates.
//!
//! Accepts what `@Query` strings contain in practice: bare or quoted keys,
//! single or double quoted strings, trailing commas, `?N` placeholders and
//! `?#{..}` / `:#{..}` SpEL expressions. Tokenized independently of Java.

use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Object(Vec<Entry>),
    Array(Vec<TemplateValue>),
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Null,
    /// `?0`
    Placeholder(usize),
    /// SpEL, only known at runtime
    Expression(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: TemplateValue,
    /// Byte range of `key: value` in the template text
    pub span: Range<usize>,
}

impl TemplateValue {
    pub fn as_object(&self) -> Option<&[Entry]> {
        match self {
            TemplateValue::Object(entries) => Some(entries),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub offset: usize,
}

impl SyntaxError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Str(String),
    Number(String),
    Placeholder(usize),
    Expression(String),
    Word(String),
}

/// Parse a whole template. Trailing content is an error.
pub fn parse(text: &str) -> Result<TemplateValue, SyntaxError> {
    check_balance(text)?;
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        end: text.len(),
    };
    if tokens.is_empty() {
        return Ok(TemplateValue::Object(Vec::new()));
    }
    let value = parser.value()?;
    if let Some((_, span)) = tokens.get(parser.pos) {
        return Err(SyntaxError::new("unexpected trailing content", span.start));
    }
    Ok(value)
}

/// Bracket nesting outside of strings must balance.
fn check_balance(text: &str) -> Result<(), SyntaxError> {
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (offset, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '{' | '[' => stack.push(c),
            '}' | ']' => {
                let open = if c == '}' { '{' } else { '[' };
                if stack.pop() != Some(open) {
                    return Err(SyntaxError::new(unbalanced(c), offset));
                }
            }
            _ => {}
        }
    }
    match stack.last() {
        Some(open) => Err(SyntaxError::new(unbalanced(*open), text.len())),
        None => Ok(()),
    }
}

fn unbalanced(c: char) -> &'static str {
    if matches!(c, '{' | '}') {
        "unbalanced braces"
    } else {
        "unbalanced brackets"
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '.')
}

fn tokenize(text: &str) -> Result<Vec<(Token, Range<usize>)>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let token = match c {
            '{' | '}' | '[' | ']' | ',' => {
                chars.next();
                match c {
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    _ => Token::Comma,
                }
            }
            ':' => {
                chars.next();
                if chars.peek().map(|(_, n)| *n) == Some('#') {
                    Token::Expression(read_expression(&mut chars, text, start)?)
                } else {
                    Token::Colon
                }
            }
            '?' => {
                chars.next();
                match chars.peek().map(|(_, n)| *n) {
                    Some('#') => Token::Expression(read_expression(&mut chars, text, start)?),
                    Some(d) if d.is_ascii_digit() => {
                        let mut digits = String::new();
                        while let Some(&(_, d)) = chars.peek() {
                            if !d.is_ascii_digit() {
                                break;
                            }
                            digits.push(d);
                            chars.next();
                        }
                        let index = digits
                            .parse()
                            .map_err(|_| SyntaxError::new("invalid placeholder", start))?;
                        Token::Placeholder(index)
                    }
                    _ => return Err(SyntaxError::new("invalid placeholder", start)),
                }
            }
            '\'' | '"' => {
                chars.next();
                Token::Str(read_string(&mut chars, c, start)?)
            }
            c if c == '-' || c.is_ascii_digit() => {
                let mut number = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !(d.is_ascii_alphanumeric() || matches!(d, '.' | '+' | '-')) {
                        break;
                    }
                    number.push(d);
                    chars.next();
                }
                Token::Number(number)
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !is_word_char(d) {
                        break;
                    }
                    word.push(d);
                    chars.next();
                }
                Token::Word(word)
            }
            other => {
                return Err(SyntaxError::new(
                    format!("unexpected character '{}'", other),
                    start,
                ))
            }
        };
        let end = chars.peek().map_or(text.len(), |(i, _)| *i);
        tokens.push((token, start..end));
    }
    Ok(tokens)
}

type CharStream<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn read_string(chars: &mut CharStream<'_>, quote: char, start: usize) -> Result<String, SyntaxError> {
    let mut out = String::new();
    while let Some((_, c)) = chars.next() {
        if c == quote {
            return Ok(out);
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some((_, 'n')) => out.push('\n'),
            Some((_, 't')) => out.push('\t'),
            Some((_, 'r')) => out.push('\r'),
            Some((_, other)) => out.push(other),
            None => break,
        }
    }
    Err(SyntaxError::new("unterminated string", start))
}

/// `?#{ ... }` or `:#{ ... }` with nested braces.
fn read_expression(chars: &mut CharStream<'_>, text: &str, start: usize) -> Result<String, SyntaxError> {
    // Consume '#', then expect '{'
    chars.next();
    if chars.next().map(|(_, c)| c) != Some('{') {
        return Err(SyntaxError::new("invalid expression", start));
    }
    let mut depth = 1;
    for (offset, c) in chars.by_ref() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(text[start..=offset].to_string());
                }
            }
            _ => {}
        }
    }
    Err(SyntaxError::new("unterminated expression", start))
}

struct Parser<'a> {
    tokens: &'a [(Token, Range<usize>)],
    pos: usize,
    end: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, s)| s.start)
    }

    fn last_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(0, |(_, s)| s.end)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), SyntaxError> {
        let offset = self.offset();
        match self.next() {
            Some(token) if token == expected => Ok(()),
            _ => Err(SyntaxError::new(format!("expected {}", what), offset)),
        }
    }

    fn value(&mut self) -> Result<TemplateValue, SyntaxError> {
        let offset = self.offset();
        let Some(token) = self.next().cloned() else {
            return Err(SyntaxError::new("unexpected end of template", offset));
        };
        match token {
            Token::LBrace => self.object(),
            Token::LBracket => self.array(),
            Token::Str(s) => Ok(TemplateValue::String(s)),
            Token::Number(n) => parse_number(&n).ok_or_else(|| SyntaxError::new("invalid number", offset)),
            Token::Placeholder(i) => Ok(TemplateValue::Placeholder(i)),
            Token::Expression(e) => Ok(TemplateValue::Expression(e)),
            Token::Word(w) => match w.as_str() {
                "true" => Ok(TemplateValue::Bool(true)),
                "false" => Ok(TemplateValue::Bool(false)),
                "null" => Ok(TemplateValue::Null),
                _ => Err(SyntaxError::new(format!("unexpected identifier '{}'", w), offset)),
            },
            _ => Err(SyntaxError::new("unexpected token", offset)),
        }
    }

    fn object(&mut self) -> Result<TemplateValue, SyntaxError> {
        let mut entries = Vec::new();
        loop {
            if self.peek() == Some(&Token::RBrace) {
                self.next();
                return Ok(TemplateValue::Object(entries));
            }
            let start = self.offset();
            let key = match self.next().cloned() {
                Some(Token::Str(key)) | Some(Token::Word(key)) | Some(Token::Number(key)) => key,
                _ => return Err(SyntaxError::new("expected key", start)),
            };
            self.expect(&Token::Colon, "':'")?;
            let value = self.value()?;
            entries.push(Entry {
                key,
                value,
                span: start..self.last_end(),
            });
            match self.peek() {
                Some(Token::Comma) => {
                    self.next();
                }
                Some(Token::RBrace) => {}
                _ => return Err(SyntaxError::new("expected ',' or '}'", self.offset())),
            }
        }
    }

    fn array(&mut self) -> Result<TemplateValue, SyntaxError> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&Token::RBracket) {
                self.next();
                return Ok(TemplateValue::Array(items));
            }
            items.push(self.value()?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.next();
                }
                Some(Token::RBracket) => {}
                _ => return Err(SyntaxError::new("expected ',' or ']'", self.offset())),
            }
        }
    }
}

fn parse_number(text: &str) -> Option<TemplateValue> {
    let trimmed = text.trim_end_matches(&['l', 'L'][..]);
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(TemplateValue::Int(i));
    }
    text.parse::<f64>().ok().map(TemplateValue::Double)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(value: &TemplateValue) -> &[Entry] {
        value.as_object().expect("Should be an object")
    }

    #[test]
    fn test_bare_keys_and_single_quotes() {
        let value = parse("{ name: 'Jaws', 'year': ?0, \"rated\": \"PG\" }").expect("Should parse");
        let entries = entries(&value);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, "name");
        assert_eq!(entries[0].value, TemplateValue::String("Jaws".to_string()));
        assert_eq!(entries[1].key, "year");
        assert_eq!(entries[1].value, TemplateValue::Placeholder(0));
        assert_eq!(entries[2].value, TemplateValue::String("PG".to_string()));
    }

    #[test]
    fn test_entry_spans_cover_key_and_value() {
        let text = "{ name: { $gt: 10, $lt: 200 } }";
        let value = parse(text).expect("Should parse");
        let entry = &entries(&value)[0];
        assert_eq!(&text[entry.span.clone()], "name: { $gt: 10, $lt: 200 }");
    }

    #[test]
    fn test_operators_arrays_and_numbers() {
        let value = parse("{ 'awards.wins': { $in: [1, 2.5, -3] }, ok: true, x: null }").expect("Should parse");
        let entries = entries(&value);
        assert_eq!(entries[0].key, "awards.wins");
        let inner = entries[0].value.as_object().expect("Should be operator doc");
        assert_eq!(inner[0].key, "$in");
        assert_eq!(
            inner[0].value,
            TemplateValue::Array(vec![
                TemplateValue::Int(1),
                TemplateValue::Double(2.5),
                TemplateValue::Int(-3),
            ])
        );
        assert_eq!(entries[1].value, TemplateValue::Bool(true));
        assert_eq!(entries[2].value, TemplateValue::Null);
    }

    #[test]
    fn test_spel_expression() {
        let value = parse("{ owner: ?#{ [0].name }, tenant: :#{#tenant} }").expect("Should parse");
        let entries = entries(&value);
        assert_eq!(
            entries[0].value,
            TemplateValue::Expression("?#{ [0].name }".to_string())
        );
        assert_eq!(
            entries[1].value,
            TemplateValue::Expression(":#{#tenant}".to_string())
        );
    }

    #[test]
    fn test_trailing_comma_and_empty() {
        assert!(parse("{ a: 1, }").is_ok());
        assert_eq!(parse("{}"), Ok(TemplateValue::Object(vec![])));
        assert_eq!(parse("   "), Ok(TemplateValue::Object(vec![])));
    }

    #[test]
    fn test_unbalanced_braces() {
        let err = parse("{ name: { $gt: 1 }").expect_err("Should fail");
        assert_eq!(err.message, "unbalanced braces");
        let err = parse("{ a: 1 }}").expect_err("Should fail");
        assert_eq!(err.message, "unbalanced braces");
    }

    #[test]
    fn test_braces_inside_strings_do_not_count() {
        let value = parse("{ pattern: '{not a brace' }").expect("Should parse");
        assert_eq!(
            entries(&value)[0].value,
            TemplateValue::String("{not a brace".to_string())
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("{ a 1 }").is_err());
        assert!(parse("{ a: 'open }").is_err());
        assert!(parse("{ a: 1 } { b: 2 }").is_err());
        assert!(parse("{ a: ? }").is_err());
        assert!(parse("{ a: ObjectId }").is_err());
    }
}
