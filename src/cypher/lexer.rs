use super::CypherError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Dot,
    Pipe,
    Star,
    Semicolon,
    Dash,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Eq,
    NotEq,
    Ident(String),
    Str(String),
    Number(f64),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token's first character.
    pub position: usize,
}

impl Token {
    /// Case-insensitive keyword check; backtick-quoted identifiers are never keywords.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, CypherError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let single = match c {
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            '{' => Some(TokenKind::LBrace),
            '}' => Some(TokenKind::RBrace),
            ':' => Some(TokenKind::Colon),
            ',' => Some(TokenKind::Comma),
            '.' => Some(TokenKind::Dot),
            '|' => Some(TokenKind::Pipe),
            '*' => Some(TokenKind::Star),
            ';' => Some(TokenKind::Semicolon),
            '-' => Some(TokenKind::Dash),
            '=' => Some(TokenKind::Eq),
            _ => None,
        };
        if let Some(kind) = single {
            chars.next();
            tokens.push(Token { kind, position: pos });
            continue;
        }

        match c {
            '<' => {
                chars.next();
                let kind = match chars.peek().map(|&(_, n)| n) {
                    Some('>') => {
                        chars.next();
                        TokenKind::NotEq
                    }
                    Some('=') => {
                        chars.next();
                        TokenKind::LtEq
                    }
                    _ => TokenKind::Lt,
                };
                tokens.push(Token { kind, position: pos });
            }
            '>' => {
                chars.next();
                let kind = if chars.peek().map(|&(_, n)| n) == Some('=') {
                    chars.next();
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                };
                tokens.push(Token { kind, position: pos });
            }
            '!' => {
                chars.next();
                if chars.peek().map(|&(_, n)| n) == Some('=') {
                    chars.next();
                    tokens.push(Token {
                        kind: TokenKind::NotEq,
                        position: pos,
                    });
                } else {
                    return Err(CypherError::syntax(pos, "unexpected character '!'"));
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, other)) => value.push(other),
                            None => break,
                        },
                        ch if ch == quote => {
                            closed = true;
                            break;
                        }
                        ch => value.push(ch),
                    }
                }
                if !closed {
                    return Err(CypherError::syntax(pos, "unterminated string literal"));
                }
                tokens.push(Token {
                    kind: TokenKind::Str(value),
                    position: pos,
                });
            }
            '`' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, ch) in chars.by_ref() {
                    if ch == '`' {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                }
                if !closed || value.is_empty() {
                    return Err(CypherError::syntax(pos, "invalid quoted identifier"));
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(value),
                    position: pos,
                });
            }
            c if c.is_ascii_digit() => {
                let mut end = pos;
                let mut seen_dot = false;
                while let Some(&(i, ch)) = chars.peek() {
                    if ch.is_ascii_digit() {
                        end = i + 1;
                        chars.next();
                    } else if ch == '.' && !seen_dot {
                        // only a fraction if a digit follows; `1..2` stays two numbers
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        if lookahead.peek().is_some_and(|&(_, d)| d.is_ascii_digit()) {
                            seen_dot = true;
                            end = i + 1;
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                let text = &input[pos..end];
                let value = text
                    .parse::<f64>()
                    .map_err(|_| CypherError::syntax(pos, format!("invalid number '{}'", text)))?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    position: pos,
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = pos;
                while let Some(&(i, ch)) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(input[pos..end].to_string()),
                    position: pos,
                });
            }
            other => {
                return Err(CypherError::syntax(pos, format!("unexpected character '{}'", other)));
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: input.len(),
    });
    Ok(tokens)
}
