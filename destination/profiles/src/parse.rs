//! A minimal protobuf IDL reader that extracts the package, service, and
//! method declarations of a document. Everything else (messages, enums,
//! options, imports) is skipped.

use std::{iter::Peekable, str::Chars, vec};

/// A declaration relevant to route derivation, in document order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Package(String),
    Service(String),
    Method { service: String, name: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: unterminated {what}")]
    Unterminated { line: usize, what: &'static str },

    #[error("line {line}: unexpected character {found:?}")]
    Character { line: usize, found: char },

    #[error("line {line}: expected {expected}, found {found}")]
    Unexpected {
        line: usize,
        expected: &'static str,
        found: String,
    },

    #[error("unexpected end of input, expected {0}")]
    Eof(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    /// Identifiers, dotted names, and numeric literals.
    Word(String),
    Str(String),
    Symbol(char),
}

struct Parser {
    tokens: Peekable<vec::IntoIter<(usize, Token)>>,
    nodes: Vec<Node>,
}

/// Parses a protobuf definition into its package, service, and method
/// declarations.
pub fn parse(input: &str) -> Result<Vec<Node>, ParseError> {
    let mut parser = Parser {
        tokens: tokenize(input)?.into_iter().peekable(),
        nodes: Vec::new(),
    };
    parser.document()?;
    Ok(parser.nodes)
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1;
    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                block_comment(&mut chars, &mut line)?;
            }
            '"' | '\'' => {
                let start = line;
                let s = string(&mut chars, c, &mut line)
                    .ok_or(ParseError::Unterminated {
                        line: start,
                        what: "string",
                    })?;
                tokens.push((start, Token::Str(s)));
            }
            c if is_word(c) => {
                let mut word = c.to_string();
                while let Some(&c) = chars.peek() {
                    if !is_word(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push((line, Token::Word(word)));
            }
            '{' | '}' | '(' | ')' | '[' | ']' | '<' | '>' | ';' | '=' | ',' | ':' | '-' | '+' => {
                tokens.push((line, Token::Symbol(c)))
            }
            found => return Err(ParseError::Character { line, found }),
        }
    }
    Ok(tokens)
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn block_comment(chars: &mut Peekable<Chars<'_>>, line: &mut usize) -> Result<(), ParseError> {
    let start = *line;
    let mut prev = None;
    for c in chars.by_ref() {
        match c {
            '/' if prev == Some('*') => return Ok(()),
            '\n' => *line += 1,
            _ => {}
        }
        prev = Some(c);
    }
    Err(ParseError::Unterminated {
        line: start,
        what: "comment",
    })
}

fn string(chars: &mut Peekable<Chars<'_>>, quote: char, line: &mut usize) -> Option<String> {
    let mut s = String::new();
    loop {
        match chars.next()? {
            '\\' => s.push(chars.next()?),
            c if c == quote => return Some(s),
            c => {
                if c == '\n' {
                    *line += 1;
                }
                s.push(c);
            }
        }
    }
}

// === impl Parser ===

impl Parser {
    fn document(&mut self) -> Result<(), ParseError> {
        while let Some((line, token)) = self.tokens.next() {
            match token {
                Token::Symbol(';') => {}
                Token::Word(kw) if kw == "package" => {
                    let name = self.word("a package name")?;
                    self.symbol(';')?;
                    self.nodes.push(Node::Package(name));
                }
                Token::Word(kw) if kw == "service" => self.service()?,
                Token::Word(_) => self.skip_statement()?,
                token => return Err(unexpected(line, "a declaration", token)),
            }
        }
        Ok(())
    }

    fn service(&mut self) -> Result<(), ParseError> {
        let service = self.word("a service name")?;
        self.symbol('{')?;
        self.nodes.push(Node::Service(service.clone()));
        loop {
            match self.next("'}'")? {
                (_, Token::Symbol('}')) => return Ok(()),
                (_, Token::Symbol(';')) => {}
                (_, Token::Word(kw)) if kw == "rpc" => {
                    let name = self.word("a method name")?;
                    self.nodes.push(Node::Method {
                        service: service.clone(),
                        name,
                    });
                    self.skip_statement()?;
                }
                (_, Token::Word(_)) => self.skip_statement()?,
                (line, token) => return Err(unexpected(line, "an rpc declaration", token)),
            }
        }
    }

    /// Skips to the end of a statement, which is either a `;` or a balanced
    /// `{ ... }` block.
    fn skip_statement(&mut self) -> Result<(), ParseError> {
        loop {
            match self.next("';'")? {
                (_, Token::Symbol(';')) => return Ok(()),
                (_, Token::Symbol('{')) => return self.skip_block(),
                _ => {}
            }
        }
    }

    fn skip_block(&mut self) -> Result<(), ParseError> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.next("'}'")? {
                (_, Token::Symbol('{')) => depth += 1,
                (_, Token::Symbol('}')) => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }

    fn next(&mut self, expected: &'static str) -> Result<(usize, Token), ParseError> {
        self.tokens.next().ok_or(ParseError::Eof(expected))
    }

    fn word(&mut self, expected: &'static str) -> Result<String, ParseError> {
        match self.next(expected)? {
            (_, Token::Word(word)) => Ok(word),
            (line, token) => Err(unexpected(line, expected, token)),
        }
    }

    fn symbol(&mut self, symbol: char) -> Result<(), ParseError> {
        let expected = match symbol {
            '{' => "'{'",
            ';' => "';'",
            _ => "a symbol",
        };
        match self.next(expected)? {
            (_, Token::Symbol(c)) if c == symbol => Ok(()),
            (line, token) => Err(unexpected(line, expected, token)),
        }
    }
}

fn unexpected(line: usize, expected: &'static str, token: Token) -> ParseError {
    let found = match token {
        Token::Word(w) => format!("{w:?}"),
        Token::Str(s) => format!("string {s:?}"),
        Token::Symbol(c) => format!("{c:?}"),
    };
    ParseError::Unexpected {
        line,
        expected,
        found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_everything_but_services() {
        let nodes = parse(
            r#"
            // Comments are ignored, including /* nested-looking */ markers.
            syntax = "proto3";
            option go_package = "github.com/example/booksapp/gen/books";
            import "google/protobuf/empty.proto";

            package booksapp.v1;

            /* A block comment
               spanning lines. */
            message Book {
                string title = 1;
                message Author { string name = 1; }
                map<string, int32> ratings = 2 [deprecated = true];
            }

            enum Genre { UNKNOWN = 0; FICTION = 1; }

            service Books {
                option (service_opt) = true;
                rpc Get (GetBook) returns (Book);
                rpc Watch (stream GetBook) returns (stream Book) {
                    option (google.api.http) = { get: "/v1/books/{id}" };
                }
                ;
            }
            "#,
        )
        .unwrap();

        assert_eq!(
            nodes,
            vec![
                Node::Package("booksapp.v1".to_string()),
                Node::Service("Books".to_string()),
                Node::Method {
                    service: "Books".to_string(),
                    name: "Get".to_string()
                },
                Node::Method {
                    service: "Books".to_string(),
                    name: "Watch".to_string()
                },
            ]
        );
    }

    #[test]
    fn reports_malformed_input() {
        assert_eq!(
            parse("service Books {\n rpc Get (A) returns (B);\n"),
            Err(ParseError::Eof("'}'"))
        );
        assert_eq!(
            parse("/* never closed"),
            Err(ParseError::Unterminated {
                line: 1,
                what: "comment"
            })
        );
        assert_eq!(
            parse("package \"books\";"),
            Err(ParseError::Unexpected {
                line: 1,
                expected: "a package name",
                found: "string \"books\"".to_string(),
            })
        );
        assert_eq!(
            parse("\nsyntax = \"proto3\" ?"),
            Err(ParseError::Character {
                line: 2,
                found: '?'
            })
        );
    }
}
