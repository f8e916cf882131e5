use std::{collections::HashMap, iter::Peekable, str::Chars, sync::OnceLock};
use strum_macros::{Display, EnumString};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals.
    Identifier,
    String,
    Number,

    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::And,
    "class" => TokenType::Class,
    "else" => TokenType::Else,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "nil" => TokenType::Nil,
    "or" => TokenType::Or,
    "print" => TokenType::Print,
    "return" => TokenType::Return,
    "super" => TokenType::Super,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "var" => TokenType::Var,
    "while" => TokenType::While,
};

// The keyword map feeds a decision tree built once; identifier
// classification walks it character by character instead of hashing.
#[derive(Debug)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    token_type: Option<TokenType>,
}

impl TrieNode {
    fn new() -> Self {
        TrieNode {
            children: HashMap::new(),
            token_type: None,
        }
    }
}

static TRIE_ROOT: OnceLock<TrieNode> = OnceLock::new();

fn keyword_trie() -> &'static TrieNode {
    TRIE_ROOT.get_or_init(|| {
        let mut root = TrieNode::new();
        for (keyword, token_type) in KEYWORDS.entries() {
            let mut node = &mut root;
            for c in keyword.chars() {
                node = node.children.entry(c).or_insert_with(TrieNode::new);
            }
            node.token_type = Some(*token_type);
        }
        root
    })
}

/// A token borrows its lexeme from the source buffer; error tokens carry
/// the message instead.
#[derive(Debug, Clone)]
pub struct Token<'a> {
    pub token_type: TokenType,
    pub value: &'a str,
    pub line: usize,
}

impl<'a> Token<'a> {
    pub fn synthetic(value: &'a str) -> Self {
        Token {
            token_type: TokenType::Identifier,
            value,
            line: 0,
        }
    }
}

pub struct Scanner<'a> {
    source: &'a str,
    chars: Peekable<Chars<'a>>,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source,
            chars: source.chars().peekable(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenType::Eof);
        }

        let c = self.advance();

        if Self::is_alpha(c) {
            return self.identifier_token();
        }
        if c.is_ascii_digit() {
            return self.number_token();
        }

        match c {
            '(' => self.make_token(TokenType::LeftParen),
            ')' => self.make_token(TokenType::RightParen),
            '{' => self.make_token(TokenType::LeftBrace),
            '}' => self.make_token(TokenType::RightBrace),
            ';' => self.make_token(TokenType::Semicolon),
            ',' => self.make_token(TokenType::Comma),
            '.' => self.make_token(TokenType::Dot),
            '-' => self.make_token(TokenType::Minus),
            '+' => self.make_token(TokenType::Plus),
            '/' => self.make_token(TokenType::Slash),
            '*' => self.make_token(TokenType::Star),
            '"' => self.string_token(),
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenType::BangEqual)
                } else {
                    self.make_token(TokenType::Bang)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenType::EqualEqual)
                } else {
                    self.make_token(TokenType::Equal)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenType::LessEqual)
                } else {
                    self.make_token(TokenType::Less)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenType::GreaterEqual)
                } else {
                    self.make_token(TokenType::Greater)
                }
            }
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_alpha(c: char) -> bool {
        c.is_ascii_alphabetic() || c == '_'
    }

    fn identifier_token(&mut self) -> Token<'a> {
        while let Some(&c) = self.peek() {
            if Self::is_alpha(c) || c.is_ascii_digit() {
                self.advance();
            } else {
                break;
            }
        }
        self.make_token(self.identifier_type())
    }

    fn identifier_type(&self) -> TokenType {
        let mut node = keyword_trie();
        for c in self.source[self.start..self.current].chars() {
            match node.children.get(&c) {
                Some(child) => node = child,
                None => return TokenType::Identifier,
            }
        }
        node.token_type.unwrap_or(TokenType::Identifier)
    }

    fn number_token(&mut self) -> Token<'a> {
        while let Some(&c) = self.peek() {
            if c.is_ascii_digit() {
                self.advance();
            } else {
                break;
            }
        }

        // A fractional part needs a digit after the dot; a trailing dot is
        // left for the property-access rule.
        if self.peek() == Some(&'.') {
            if let Some(c) = self.peek_next() {
                if c.is_ascii_digit() {
                    self.advance();
                    while let Some(&c) = self.peek() {
                        if c.is_ascii_digit() {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        self.make_token(TokenType::Number)
    }

    fn string_token(&mut self) -> Token<'a> {
        while let Some(&c) = self.peek() {
            if c == '"' {
                break;
            }
            if c == '\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        self.advance(); // closing quote
        self.make_token(TokenType::String)
    }

    fn skip_whitespace(&mut self) {
        loop {
            // Cached up front: the peeked character borrows the cursor.
            let next = self.peek_next();
            match self.peek() {
                Some(&'\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some(&c) if c.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(&'/') if next == Some('/') => {
                    while let Some(&c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn peek(&mut self) -> Option<&char> {
        self.chars.peek()
    }

    fn peek_next(&self) -> Option<char> {
        let mut iter = self.chars.clone();
        iter.next();
        iter.next()
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        match self.chars.next() {
            Some(c) => {
                self.current += c.len_utf8();
                c
            }
            None => '\0',
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(&expected) {
            self.advance();
            return true;
        }
        false
    }

    fn make_token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'a> {
        Token {
            token_type: TokenType::Error,
            value: message,
            line: self.line,
        }
    }
}
