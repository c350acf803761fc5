use crate::{
    lang::source_buffer::{SourceBuffer, SourceLocation},
    runtime::{data_structures::quotation::QuotationId, error},
};
use std::fmt::{self, Display, Formatter};

/// A token is a simple unit of the language.  Tokens are produced by the tokenizer directly from
/// source text (`Word`, `Str`), or synthesized by the interpreter itself when it captures a
/// nested quotation at compile time (`QuoteRef`) -- see `lang::tokenizing`'s sibling,
/// `runtime::interpreter`, for where `QuoteRef` tokens are actually created.
///
/// Unlike a textual encoding, `QuoteRef` carries the interned quotation's id directly as a typed
/// field; there is no address-in-a-string scheme anywhere in this tokenizer.
#[derive(Clone)]
pub enum Token {
    /// A name to be looked up in the dictionary, or text that parses as a number.
    Word(SourceLocation, String),

    /// A string literal, already escape-decoded.
    Str(SourceLocation, String),

    /// A reference to a quotation interned during compilation of the enclosing definition.
    QuoteRef(SourceLocation, QuotationId),
}

/// A list of tokens found in the source code.
pub type TokenList = Vec<Token>;

impl Token {
    /// The token's location in the original source text.
    pub fn location(&self) -> &SourceLocation {
        match self {
            Token::Word(location, _) => location,
            Token::Str(location, _) => location,
            Token::QuoteRef(location, _) => location,
        }
    }
}

/// Make sure the tokens are printable for debugging and error reporting purposes.
impl Display for Token {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Token::Word(_, word) => write!(f, "{}", word),
            Token::Str(_, text) => write!(f, "{:?}", text),
            Token::QuoteRef(_, id) => write!(f, "[quote #{}]", id),
        }
    }
}

/// Check if the given character is considered whitespace.
fn is_whitespace(next: char) -> bool {
    next == ' ' || next == '\t' || next == '\r' || next == '\n'
}

/// Skip over whitespace in the text.  Stops only at either the end of the buffer or the next
/// non-whitespace character.
fn skip_whitespace(buffer: &mut SourceBuffer) {
    while let Some(next) = buffer.peek_next() {
        if !is_whitespace(next) {
            break;
        }

        let _ = buffer.next_char();
    }
}

/// Consume a `\` line comment through (but not including) the next newline.  Called with the `\`
/// already peeked but not consumed.
fn skip_line_comment(buffer: &mut SourceBuffer) {
    let _ = buffer.next_char(); // The leading backslash.

    while let Some(next) = buffer.peek_next() {
        if next == '\n' {
            break;
        }

        let _ = buffer.next_char();
    }
}

/// Consume a `( ... )` block comment through (and including) the next `)`.  An unterminated block
/// comment silently consumes to end-of-input without error, matching the tokenizer's general
/// policy of accepting unterminated constructs rather than failing on them.
fn skip_block_comment(buffer: &mut SourceBuffer) {
    let _ = buffer.next_char(); // The leading (.

    while let Some(next) = buffer.next_char() {
        if next == ')' {
            break;
        }
    }
}

/// Decode a single escape sequence within a string literal.  The backslash has already been
/// consumed; this reads the character that follows it.  Unrecognized escapes pass the following
/// character through literally.
fn process_escape(buffer: &mut SourceBuffer) -> Option<char> {
    match buffer.next_char() {
        Some('n') => Some('\n'),
        Some('r') => Some('\r'),
        Some('t') => Some('\t'),
        Some('"') => Some('"'),
        Some('\\') => Some('\\'),
        Some(other) => Some(other),
        None => None,
    }
}

/// Process a single string literal.  The opening `"` has already been peeked but not consumed.
/// A literal missing its closing quote is accepted silently, terminating at end-of-input.
fn process_string(buffer: &mut SourceBuffer) -> (SourceLocation, String) {
    let _ = buffer.next_char(); // The opening ".
    let location = buffer.location().clone();
    let mut text = String::new();

    loop {
        match buffer.peek_next() {
            Some('"') => {
                let _ = buffer.next_char();
                break;
            }

            Some('\\') => {
                let _ = buffer.next_char();

                if let Some(decoded) = process_escape(buffer) {
                    text.push(decoded);
                } else {
                    break; // Hit end of input mid-escape; accept what we have.
                }
            }

            Some(_) => {
                text.push(buffer.next_char().unwrap());
            }

            None => break, // Unterminated string; accept silently.
        }
    }

    (location, text)
}

/// Pull text out of the buffer until whitespace or the start of a line comment.  Used for both
/// words and number literals, which are only distinguished later by the interpreter.
fn process_word(buffer: &mut SourceBuffer) -> (SourceLocation, String) {
    let location = buffer.location().clone();
    let mut text = String::new();

    while let Some(next) = buffer.peek_next() {
        if is_whitespace(next) || next == '\\' {
            break;
        }

        text.push(buffer.next_char().unwrap());
    }

    (location, text)
}

/// Tokenize the source code from a string already in memory.
pub fn tokenize_from_source(path: &str, source: &str) -> error::Result<TokenList> {
    let mut buffer = SourceBuffer::new(path, source);
    let mut tokens = TokenList::new();

    while let Some(next) = buffer.peek_next() {
        if is_whitespace(next) {
            skip_whitespace(&mut buffer);
            continue;
        }

        if next == '\\' {
            skip_line_comment(&mut buffer);
            continue;
        }

        if next == '(' {
            skip_block_comment(&mut buffer);
            continue;
        }

        if next == '"' {
            let (location, text) = process_string(&mut buffer);
            tokens.push(Token::Str(location, text));
            continue;
        }

        let (location, text) = process_word(&mut buffer);
        tokens.push(Token::Word(location, text));
    }

    Ok(tokens)
}

/// Load the code from a file and then tokenize it.
pub fn tokenize_from_file(path: &str) -> error::Result<TokenList> {
    let source = std::fs::read_to_string(path)?;
    tokenize_from_source(path, &source)
}

/// Attempt to parse a word's text as a signed 64-bit integer using the auto-base rules: a `0x` or
/// `0X` prefix selects hexadecimal, a leading `0` followed by further digits selects octal,
/// otherwise the text is parsed as decimal.  Returns `None` if the text isn't a valid number in
/// any of those bases, in which case the caller should treat it as a dictionary lookup instead.
pub fn parse_number(text: &str) -> Option<i64> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    if unsigned.is_empty() {
        return None;
    }

    let value = if let Some(hex) = unsigned.strip_prefix("0x").or_else(|| unsigned.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if unsigned.len() > 1 && unsigned.starts_with('0') && unsigned.as_bytes().iter().all(|b| b.is_ascii_digit()) {
        i64::from_str_radix(&unsigned[1..], 8).ok()?
    } else if unsigned.as_bytes().iter().all(|b| b.is_ascii_digit()) {
        unsigned.parse::<i64>().ok()?
    } else {
        return None;
    };

    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::parse_number;
    use test_case::test_case;

    #[test_case("255", 255)]
    #[test_case("0xFF", 255)]
    #[test_case("0XFF", 255)]
    #[test_case("0377", 255)]
    #[test_case("0", 0)]
    #[test_case("-42", -42)]
    #[test_case("-0x2A", -42)]
    fn parses_every_base_to_the_same_value(text: &str, expected: i64) {
        assert_eq!(parse_number(text), Some(expected));
    }

    #[test_case("hello")]
    #[test_case("12a")]
    #[test_case("0x")]
    #[test_case("-")]
    #[test_case("")]
    fn rejects_non_numeric_text(text: &str) {
        assert_eq!(parse_number(text), None);
    }

    #[test]
    fn every_base_of_255_parses_to_the_same_integer() {
        let decimal = parse_number("255").unwrap();
        let hex = parse_number("0xFF").unwrap();
        let octal = parse_number("0377").unwrap();

        assert_eq!(decimal, hex);
        assert_eq!(hex, octal);
    }
}
