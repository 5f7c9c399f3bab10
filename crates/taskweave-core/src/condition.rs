//! Condition expressions gating conditional task execution.
//!
//! The grammar is a minimal boolean language over task ids:
//!
//! ```text
//! expr    := or
//! or      := and ( OR and )*
//! and     := unary ( AND unary )*
//! unary   := NOT unary | primary
//! primary := '(' expr ')' | task_id
//! ```
//!
//! A bare task id evaluates to "that task completed". Keywords are
//! case-insensitive. Expressions are parsed once at workflow validation
//! and evaluated against the completed set at dispatch time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::error::{WeaveError, WeaveResult};

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    Id(String),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Parse a condition expression.
    pub fn parse(input: &str) -> WeaveResult<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(WeaveError::Validation(format!(
                "unexpected trailing input in condition: {input:?}"
            )));
        }
        Ok(expr)
    }

    /// Evaluate against the set of completed task ids.
    pub fn eval(&self, completed: &HashSet<&str>) -> bool {
        match self {
            Condition::Id(id) => completed.contains(id.as_str()),
            Condition::Not(inner) => !inner.eval(completed),
            Condition::And(a, b) => a.eval(completed) && b.eval(completed),
            Condition::Or(a, b) => a.eval(completed) || b.eval(completed),
        }
    }

    /// All task ids this condition mentions.
    pub fn referenced_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, ids: &mut BTreeSet<String>) {
        match self {
            Condition::Id(id) => {
                ids.insert(id.clone());
            }
            Condition::Not(inner) => inner.collect_ids(ids),
            Condition::And(a, b) | Condition::Or(a, b) => {
                a.collect_ids(ids);
                b.collect_ids(ids);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> WeaveResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_uppercase().as_str() {
                    "NOT" => tokens.push(Token::Not),
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(WeaveError::Validation(format!(
                    "invalid character {other:?} in condition: {input:?}"
                )));
            }
        }
    }

    if tokens.is_empty() {
        return Err(WeaveError::Validation("empty condition expression".into()));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> WeaveResult<Condition> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> WeaveResult<Condition> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> WeaveResult<Condition> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Condition::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> WeaveResult<Condition> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(WeaveError::Validation(
                        "unbalanced parenthesis in condition".into(),
                    )),
                }
            }
            Some(Token::Ident(id)) => Ok(Condition::Id(id)),
            other => Err(WeaveError::Validation(format!(
                "expected task id or '(' in condition, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(ids: &[&'static str]) -> HashSet<&'static str> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_bare_id() {
        let cond = Condition::parse("check").unwrap();
        assert_eq!(cond, Condition::Id("check".into()));
        assert!(cond.eval(&completed(&["check"])));
        assert!(!cond.eval(&completed(&[])));
    }

    #[test]
    fn test_not() {
        let cond = Condition::parse("NOT check").unwrap();
        assert!(!cond.eval(&completed(&["check"])));
        assert!(cond.eval(&completed(&[])));
    }

    #[test]
    fn test_and_or_precedence() {
        // AND binds tighter than OR.
        let cond = Condition::parse("a OR b AND c").unwrap();
        assert!(cond.eval(&completed(&["a"])));
        assert!(cond.eval(&completed(&["b", "c"])));
        assert!(!cond.eval(&completed(&["b"])));
    }

    #[test]
    fn test_parentheses() {
        let cond = Condition::parse("(a OR b) AND c").unwrap();
        assert!(!cond.eval(&completed(&["a"])));
        assert!(cond.eval(&completed(&["a", "c"])));
        assert!(cond.eval(&completed(&["b", "c"])));
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let cond = Condition::parse("not a and b").unwrap();
        assert!(cond.eval(&completed(&["b"])));
        assert!(!cond.eval(&completed(&["a", "b"])));
    }

    #[test]
    fn test_ids_with_punctuation() {
        let cond = Condition::parse("fetch-data AND parse.step_2").unwrap();
        assert_eq!(
            cond.referenced_ids().into_iter().collect::<Vec<_>>(),
            vec!["fetch-data".to_string(), "parse.step_2".to_string()]
        );
    }

    #[test]
    fn test_referenced_ids_dedup() {
        let cond = Condition::parse("a AND (a OR b)").unwrap();
        assert_eq!(cond.referenced_ids().len(), 2);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("a AND").is_err());
        assert!(Condition::parse("(a OR b").is_err());
        assert!(Condition::parse("a ! b").is_err());
        assert!(Condition::parse("a b").is_err());
    }
}
