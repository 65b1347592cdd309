//! A small hand-written recursive-descent parser for the ELFHex surface language.
//!
//! This stands in for "any parser generator" — the surface grammar is treated as an external
//! collaborator by the assembler crate, which only ever consumes [`ast::File`]. Swapping this
//! module for a grammar-generated parser does not change anything downstream.

use crate::ast::{
    Endianness, File, FragmentDef, FragmentRef, Include, Item, Metadata, Node, NumberLit,
    SegmentArgs, SegmentDecl,
};

/// An error encountered while parsing source text into a [`File`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    /// A human-readable description of the problem.
    message: String,
    /// The 1-based line on which the problem was found.
    line: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parses `source` into a [`File`].
///
/// # Errors
///
/// Returns a [`ParseError`] for any malformed token, missing delimiter, or unexpected
/// end-of-input.
pub fn parse(source: &str) -> Result<File, ParseError> {
    Parser::new(source).parse_file()
}

struct Parser<'a> {
    rest: &'a str,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            rest: source,
            line: 1,
        }
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError::new(message, self.line))
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let mut chars = self.rest.chars();
        let c = chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        self.rest = chars.as_str();
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn eat_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_trivia();
        if self.peek() == Some(expected) {
            self.bump();
            Ok(())
        } else {
            self.err(format!(
                "expected '{expected}', found {:?}",
                self.peek()
            ))
        }
    }

    fn eat_str(&mut self, expected: &str) -> bool {
        self.skip_trivia();
        if self.rest.starts_with(expected) {
            for _ in expected.chars() {
                self.bump();
            }
            true
        } else {
            false
        }
    }

    /// Consumes a maximal run of non-trivia, non-delimiter characters.
    fn word(&mut self) -> Result<&'a str, ParseError> {
        self.skip_trivia();
        let start = self.rest;
        let mut len = 0;
        for c in self.rest.chars() {
            if c.is_whitespace() || "(){}[]<>:,@$#\"".contains(c) {
                break;
            }
            len += c.len_utf8();
        }
        if len == 0 {
            return self.err(format!("expected a name or literal, found {:?}", self.peek()));
        }
        let word = &start[..len];
        for _ in word.chars() {
            self.bump();
        }
        Ok(word)
    }

    fn quoted_string(&mut self) -> Result<Vec<u8>, ParseError> {
        self.eat_char('"')?;
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some(c) => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
                None => return self.err("unterminated string literal"),
            }
        }
        Ok(bytes)
    }

    fn name(&mut self) -> Result<String, ParseError> {
        self.word().map(str::to_owned)
    }

    fn int(&mut self) -> Result<u64, ParseError> {
        let word = self.word()?;
        word.parse::<u64>()
            .map_err(|_| ParseError::new(format!("expected an integer, found {word:?}"), self.line))
    }

    fn parse_file(mut self) -> Result<File, ParseError> {
        self.skip_trivia();
        let metadata = if self.rest.starts_with("program") {
            Some(self.metadata()?)
        } else {
            None
        };

        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if self.rest.is_empty() {
                break;
            }
            if self.eat_str("include") {
                items.push(Item::Include(self.include()?));
            } else if self.eat_str("fragment") {
                items.push(Item::Fragment(self.fragment_def()?));
            } else if self.eat_str("segment") {
                items.push(Item::Segment(self.segment_decl()?));
            } else {
                return self.err(format!(
                    "expected 'include', 'fragment', or 'segment', found {:?}",
                    self.peek()
                ));
            }
        }

        Ok(File { metadata, items })
    }

    fn metadata(&mut self) -> Result<Metadata, ParseError> {
        self.eat_str("program");
        let machine = self.int()?;
        let machine = u16::try_from(machine)
            .map_err(|_| ParseError::new("machine identifier out of range", self.line))?;
        self.skip_trivia();
        let endianness = match self.bump() {
            Some('<') => Endianness::Little,
            Some('>') => Endianness::Big,
            other => return self.err(format!("expected '<' or '>', found {other:?}")),
        };
        let align = self.int()?;
        Ok(Metadata {
            machine,
            endianness,
            align,
        })
    }

    fn include(&mut self) -> Result<Include, ParseError> {
        self.skip_trivia();
        let fragments_only = self.eat_str("fragments");
        let path = String::from_utf8(self.quoted_string()?)
            .map_err(|_| ParseError::new("include path is not valid UTF-8", self.line))?;
        Ok(Include {
            path,
            fragments_only,
        })
    }

    fn fragment_def(&mut self) -> Result<FragmentDef, ParseError> {
        let name = self.name()?;
        self.eat_char('(')?;
        let mut parameters = Vec::new();
        self.skip_trivia();
        while self.peek() != Some(')') {
            parameters.push(self.name()?);
            self.skip_trivia();
        }
        self.eat_char(')')?;
        self.eat_char('{')?;
        let body = self.nodes_until('}')?;
        self.eat_char('}')?;
        Ok(FragmentDef {
            name,
            parameters,
            body,
        })
    }

    fn segment_decl(&mut self) -> Result<SegmentDecl, ParseError> {
        let name = self.name()?;
        self.eat_char('(')?;
        let args = self.segment_args()?;
        self.eat_char(')')?;
        self.eat_char('{')?;
        let mut contents = Vec::new();
        let mut auto_labels = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some('}') {
                break;
            }
            if self.eat_str("[[") {
                auto_labels.extend(self.auto_label_block()?);
                continue;
            }
            contents.push(self.node()?);
        }
        self.eat_char('}')?;
        Ok(SegmentDecl {
            name,
            args,
            contents,
            auto_labels,
        })
    }

    fn segment_args(&mut self) -> Result<SegmentArgs, ParseError> {
        let mut args = SegmentArgs::default();
        self.skip_trivia();
        while self.peek() != Some(')') {
            let key = self.name()?;
            self.eat_char(':')?;
            let value = self.word()?.to_owned();
            match key.as_str() {
                "flags" => args.flags = Some(value),
                "align" => {
                    args.align = Some(value.parse().map_err(|_| {
                        ParseError::new("segment align must be an integer", self.line)
                    })?);
                }
                "size" => {
                    args.size = Some(value.parse().map_err(|_| {
                        ParseError::new("segment size must be an integer", self.line)
                    })?);
                }
                other => return self.err(format!("unrecognised segment argument {other:?}")),
            }
            self.skip_trivia();
        }
        Ok(args)
    }

    fn auto_label_block(&mut self) -> Result<Vec<(String, u64)>, ParseError> {
        let mut labels = Vec::new();
        self.skip_trivia();
        while !self.eat_str("]]") {
            let name = self.name()?;
            self.eat_char(':')?;
            let width = self.int()?;
            labels.push((name, width));
            self.skip_trivia();
        }
        Ok(labels)
    }

    fn nodes_until(&mut self, terminator: char) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(terminator) {
                break;
            }
            if self.rest.is_empty() {
                return self.err(format!("unexpected end of input, expected '{terminator}'"));
            }
            nodes.push(self.node()?);
        }
        Ok(nodes)
    }

    fn node(&mut self) -> Result<Node, ParseError> {
        self.skip_trivia();
        match self.peek() {
            Some('"') => Ok(Node::String(self.quoted_string()?)),
            Some('[') => self.label_or_autolabels(),
            Some('<') => self.reference(),
            Some('@') => Ok(Node::FragmentRef(self.fragment_ref()?)),
            Some('$') => {
                self.bump();
                Ok(Node::FragmentVar(self.name()?))
            }
            Some(':') => self.extension(),
            Some(_) => self.byte_or_number(),
            None => self.err("unexpected end of input"),
        }
    }

    fn label_or_autolabels(&mut self) -> Result<Node, ParseError> {
        self.eat_char('[')?;
        let name = self.name()?;
        self.eat_char(']')?;
        Ok(Node::Label(name))
    }

    fn reference(&mut self) -> Result<Node, ParseError> {
        if self.eat_str("<<") {
            let first = self.name()?;
            self.skip_trivia();
            let (segment, target) = if self.peek() == Some(':') {
                self.bump();
                (Some(first), self.name()?)
            } else {
                (None, first)
            };
            self.skip_trivia();
            let offset = match self.peek() {
                Some('+') | Some('-') => {
                    let sign = self.bump().expect("peeked");
                    self.skip_trivia();
                    let magnitude = self.int()? as i64;
                    if sign == '-' {
                        -magnitude
                    } else {
                        magnitude
                    }
                }
                _ => 0,
            };
            self.eat_str(">>");
            Ok(Node::AbsoluteRef {
                target,
                offset,
                segment,
            })
        } else {
            self.eat_char('<')?;
            let target = self.name()?;
            self.skip_trivia();
            let width = if self.peek() == Some(':') {
                self.bump();
                self.int()? as u8
            } else {
                1
            };
            self.eat_char('>')?;
            Ok(Node::RelativeRef { target, width })
        }
    }

    fn fragment_ref(&mut self) -> Result<Node, ParseError> {
        self.eat_char('@')?;
        let unique = self.peek() == Some('!');
        if unique {
            self.bump();
        }
        let name = self.name()?;
        self.eat_char('(')?;
        let mut actuals = Vec::new();
        self.skip_trivia();
        if self.peek() != Some(')') {
            loop {
                let mut actual = Vec::new();
                self.skip_trivia();
                while !matches!(self.peek(), Some(')') | Some(',')) {
                    actual.push(self.node()?);
                    self.skip_trivia();
                }
                actuals.push(actual);
                if self.peek() == Some(',') {
                    self.bump();
                    continue;
                }
                break;
            }
        }
        self.eat_char(')')?;

        self.skip_trivia();
        let alias = if self.peek() == Some('(') {
            self.bump();
            let alias = self.name()?;
            self.eat_char(')')?;
            Some(alias)
        } else {
            None
        };

        Ok(Node::FragmentRef(FragmentRef {
            name,
            actuals,
            alias,
            unique,
        }))
    }

    fn extension(&mut self) -> Result<Node, ParseError> {
        let qualified = self.eat_str("::");
        if !qualified {
            self.eat_char(':')?;
        }
        let name = self.word()?.to_owned();
        self.eat_char('{')?;
        let start = self.rest;
        let mut depth = 1usize;
        let mut len = 0;
        for c in self.rest.chars() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            len += c.len_utf8();
        }
        let payload = start[..len].trim().to_owned();
        for _ in start[..len].chars() {
            self.bump();
        }
        self.eat_char('}')?;
        Ok(Node::Extension {
            name,
            payload,
            qualified,
        })
    }

    fn byte_or_number(&mut self) -> Result<Node, ParseError> {
        let word = self.word()?;
        if matches!(word.as_bytes().first(), Some(b'=' | b'+' | b'-')) {
            parse_number(word)
                .map(Node::Number)
                .map_err(|message| ParseError::new(message, self.line))
        } else if word.len() == 2 && word.chars().all(|c| c.is_ascii_hexdigit()) {
            let value = u8::from_str_radix(word, 16)
                .map_err(|_| ParseError::new(format!("invalid byte literal {word:?}"), self.line))?;
            Ok(Node::Byte(value))
        } else {
            self.err(format!("unrecognised token {word:?}"))
        }
    }
}

/// Parses a number literal of the form `[sign]<digits><base><width>`.
fn parse_number(word: &str) -> Result<NumberLit, String> {
    let (sign, rest) = match word.as_bytes().first() {
        Some(b'=') => (Sign::Unsigned, &word[1..]),
        Some(b'+') => (Sign::Positive, &word[1..]),
        Some(b'-') => (Sign::Negative, &word[1..]),
        _ => return Err(format!("number literal {word:?} is missing a sign")),
    };
    if rest.is_empty() {
        return Err(format!("number literal {word:?} has no digits"));
    }

    let bytes = rest.as_bytes();
    let last = bytes[bytes.len() - 1];
    let (digits, base_char, width) = if last.is_ascii_digit() && bytes.len() >= 2 {
        let base_char = bytes[bytes.len() - 2];
        if base_char == b'b' || base_char == b'd' || base_char == b'h' {
            (&rest[..rest.len() - 2], base_char, last - b'0')
        } else {
            (&rest[..rest.len() - 1], last, 1)
        }
    } else {
        (&rest[..rest.len() - 1], last, 1)
    };

    let base = match base_char {
        b'b' => 2,
        b'h' => 16,
        b'd' => 10,
        other => return Err(format!("unrecognised number base {:?}", other as char)),
    };

    let magnitude = i128::from_str_radix(digits, base)
        .map_err(|_| format!("invalid digits {digits:?} for base {base}"))?;
    let value = if matches!(sign, Sign::Negative) {
        -magnitude
    } else {
        magnitude
    };

    Ok(NumberLit {
        value,
        width,
        signed: !matches!(sign, Sign::Unsigned),
    })
}

enum Sign {
    Unsigned,
    Positive,
    Negative,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ast::{Item, Node};

    #[test]
    fn metadata_and_segment() {
        let file = parse("program 3 < 16 segment a() { ff }").expect("parses");
        let metadata = file.metadata.expect("has metadata");
        assert_eq!(metadata.machine, 3);
        assert_eq!(metadata.endianness, Endianness::Little);
        assert_eq!(metadata.align, 16);
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        assert_eq!(segment.contents, vec![Node::Byte(0xff)]);
    }

    #[test]
    fn number_literals() {
        assert_eq!(
            parse_number("=10d4").unwrap(),
            NumberLit {
                value: 10,
                width: 4,
                signed: false
            }
        );
        assert_eq!(
            parse_number("+ah2").unwrap(),
            NumberLit {
                value: 10,
                width: 2,
                signed: true
            }
        );
        assert_eq!(
            parse_number("-1001b").unwrap(),
            NumberLit {
                value: -9,
                width: 1,
                signed: true
            }
        );
    }

    #[test]
    fn relative_and_absolute_references() {
        let file = parse("program 3 < 16 segment a() { <a> <b:4> <<c>> <<d + 4>> <<s:e - 2>> }")
            .unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        assert_eq!(
            segment.contents,
            vec![
                Node::RelativeRef {
                    target: "a".into(),
                    width: 1
                },
                Node::RelativeRef {
                    target: "b".into(),
                    width: 4
                },
                Node::AbsoluteRef {
                    target: "c".into(),
                    offset: 0,
                    segment: None
                },
                Node::AbsoluteRef {
                    target: "d".into(),
                    offset: 4,
                    segment: None
                },
                Node::AbsoluteRef {
                    target: "e".into(),
                    offset: -2,
                    segment: Some("s".into())
                },
            ]
        );
    }

    #[test]
    fn fragment_ref_with_alias_and_actuals() {
        let file =
            parse("program 3 < 16 segment a() { @f(ff, ee)(test) @!g() }").unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        let Node::FragmentRef(reference) = &segment.contents[0] else {
            panic!("expected a fragment reference");
        };
        assert_eq!(reference.name, "f");
        assert_eq!(reference.alias.as_deref(), Some("test"));
        assert_eq!(reference.actuals.len(), 2);
        assert!(!reference.unique);

        let Node::FragmentRef(reference) = &segment.contents[1] else {
            panic!("expected a fragment reference");
        };
        assert!(reference.unique);
        assert!(reference.actuals.is_empty());
    }

    #[test]
    fn auto_label_block_and_extension() {
        let file = parse(
            "program 3 < 16 segment a() { 00 [[a: 4 b: 8]] :modrm { mod=3 } }",
        )
        .unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        assert_eq!(
            segment.auto_labels,
            vec![("a".to_string(), 4), ("b".to_string(), 8)]
        );
        assert_eq!(segment.contents[0], Node::Byte(0x00));
        let Node::Extension {
            name,
            payload,
            qualified,
        } = &segment.contents[1]
        else {
            panic!("expected an extension");
        };
        assert_eq!(name, "modrm");
        assert_eq!(payload, "mod=3");
        assert!(!qualified);
    }

    #[test]
    fn comment_to_end_of_line_is_ignored() {
        let file = parse("program 3 < 16 segment a() { ff ee # a comment\n }").unwrap();
        let Item::Segment(segment) = &file.items[0] else {
            panic!("expected a segment");
        };
        assert_eq!(segment.contents, vec![Node::Byte(0xff), Node::Byte(0xee)]);
    }

    #[test]
    fn include_directive() {
        let file = parse("include fragments \"other.eh\"").unwrap();
        let Item::Include(include) = &file.items[0] else {
            panic!("expected an include");
        };
        assert_eq!(include.path, "other.eh");
        assert!(include.fragments_only);
    }
}
