use std::collections::{BTreeMap, BTreeSet};

use super::ast::{
    ComparisonOperator, Condition, CypherQuery, Direction, MatchPattern, NodePattern, Operand, PropertyValue,
    RelationshipPattern, ReturnClause,
};
use super::lexer::{tokenize, Token, TokenKind};
use super::CypherError;

/// Parse query text into a [`CypherQuery`].
///
/// Blank input yields the empty query. Anything else that does not form a
/// complete `MATCH ... RETURN ...` statement is a [`CypherError::Syntax`].
pub fn parse(input: &str) -> Result<CypherQuery, CypherError> {
    if input.trim().is_empty() {
        return Ok(CypherQuery::default());
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let query = parser.parse_query()?;
    validate_variables(&query, &parser)?;
    Ok(query)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always appends Eof, and advance never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token, CypherError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), CypherError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", keyword)))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, CypherError> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn error(&self, message: impl Into<String>) -> CypherError {
        let token = self.peek();
        let found = match &token.kind {
            TokenKind::Eof => "end of input".to_string(),
            other => format!("{:?}", other),
        };
        CypherError::syntax(token.position, format!("{}, found {}", message.into(), found))
    }

    fn parse_query(&mut self) -> Result<CypherQuery, CypherError> {
        let mut query = CypherQuery::default();

        self.expect_keyword("MATCH")?;
        loop {
            query.match_patterns.push(self.parse_pattern()?);
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            if self.eat_keyword("MATCH") {
                continue;
            }
            break;
        }

        if self.eat_keyword("WHERE") {
            query.where_clause = Some(self.parse_or()?);
        }

        self.expect_keyword("RETURN")?;
        query.return_clause = self.parse_return()?;

        if self.eat_keyword("LIMIT") {
            let token = self.advance();
            match token.kind {
                TokenKind::Number(n) if n >= 0.0 && n.fract() == 0.0 => query.limit = Some(n as usize),
                _ => {
                    return Err(CypherError::syntax(
                        token.position,
                        "LIMIT expects a non-negative integer",
                    ))
                }
            }
        }

        self.eat(&TokenKind::Semicolon);
        if !self.check(&TokenKind::Eof) {
            return Err(self.error("expected end of query"));
        }
        Ok(query)
    }

    fn parse_pattern(&mut self) -> Result<MatchPattern, CypherError> {
        let mut pattern = MatchPattern::default();
        pattern.nodes.push(self.parse_node()?);
        while self.check(&TokenKind::Dash) || self.check(&TokenKind::Lt) {
            pattern.relationships.push(self.parse_relationship()?);
            pattern.nodes.push(self.parse_node()?);
        }
        Ok(pattern)
    }

    fn parse_node(&mut self) -> Result<NodePattern, CypherError> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut node = NodePattern::default();

        if let TokenKind::Ident(name) = &self.peek().kind {
            node.variable = Some(name.clone());
            self.advance();
        }
        while self.eat(&TokenKind::Colon) {
            node.labels.push(self.expect_ident("label")?);
        }
        if self.check(&TokenKind::LBrace) {
            node.properties = self.parse_property_map()?;
        }

        self.expect(&TokenKind::RParen, "')'")?;
        Ok(node)
    }

    fn parse_property_map(&mut self) -> Result<BTreeMap<String, PropertyValue>, CypherError> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut properties = BTreeMap::new();
        if self.eat(&TokenKind::RBrace) {
            return Ok(properties);
        }
        loop {
            let key = self.expect_ident("property name")?;
            self.expect(&TokenKind::Colon, "':'")?;
            let value = self.parse_literal()?;
            properties.insert(key, value);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(properties)
    }

    /// `-[..]->`, `<-[..]-`, `-[..]-`, `-->`, `<--`, `--`
    fn parse_relationship(&mut self) -> Result<RelationshipPattern, CypherError> {
        let incoming = self.eat(&TokenKind::Lt);
        self.expect(&TokenKind::Dash, "'-'")?;

        let mut rel = RelationshipPattern {
            variable: None,
            types: Vec::new(),
            direction: Direction::Either,
        };

        if self.eat(&TokenKind::LBracket) {
            if let TokenKind::Ident(name) = &self.peek().kind {
                rel.variable = Some(name.clone());
                self.advance();
            }
            if self.eat(&TokenKind::Colon) {
                rel.types.push(self.expect_ident("relationship type")?);
                while self.eat(&TokenKind::Pipe) {
                    self.eat(&TokenKind::Colon);
                    rel.types.push(self.expect_ident("relationship type")?);
                }
            }
            self.expect(&TokenKind::RBracket, "']'")?;
        }

        self.expect(&TokenKind::Dash, "'-'")?;
        let outgoing = self.eat(&TokenKind::Gt);

        rel.direction = match (incoming, outgoing) {
            (true, false) => Direction::Incoming,
            (false, true) => Direction::Outgoing,
            _ => Direction::Either,
        };
        Ok(rel)
    }

    fn parse_return(&mut self) -> Result<ReturnClause, CypherError> {
        if self.eat(&TokenKind::Star) {
            return Ok(ReturnClause::All);
        }
        let mut variables = vec![self.expect_ident("return variable or '*'")?];
        while self.eat(&TokenKind::Comma) {
            variables.push(self.expect_ident("return variable")?);
        }
        Ok(ReturnClause::Variables(variables))
    }

    fn parse_or(&mut self) -> Result<Condition, CypherError> {
        let mut children = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Condition::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<Condition, CypherError> {
        let mut children = vec![self.parse_not()?];
        while self.eat_keyword("AND") {
            children.push(self.parse_not()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Condition::And(children)
        })
    }

    fn parse_not(&mut self) -> Result<Condition, CypherError> {
        if self.eat_keyword("NOT") {
            return Ok(Condition::Not(Box::new(self.parse_not()?)));
        }
        if self.eat(&TokenKind::LParen) {
            let inner = self.parse_or()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Condition, CypherError> {
        let left = self.parse_operand()?;
        let operator = match &self.peek().kind {
            TokenKind::Eq => ComparisonOperator::Eq,
            TokenKind::NotEq => ComparisonOperator::NotEq,
            TokenKind::Lt => ComparisonOperator::Lt,
            TokenKind::Gt => ComparisonOperator::Gt,
            TokenKind::LtEq => ComparisonOperator::LtEq,
            TokenKind::GtEq => ComparisonOperator::GtEq,
            _ if self.peek().is_keyword("CONTAINS") => ComparisonOperator::Contains,
            _ => return Err(self.error("expected comparison operator")),
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Condition::Comparison { left, operator, right })
    }

    fn parse_operand(&mut self) -> Result<Operand, CypherError> {
        let is_property = matches!(self.peek().kind, TokenKind::Ident(_))
            && self.peek_at(1).kind == TokenKind::Dot
            && !self.peek().is_keyword("TRUE")
            && !self.peek().is_keyword("FALSE")
            && !self.peek().is_keyword("NULL");
        if is_property {
            let variable = self.expect_ident("variable")?;
            self.expect(&TokenKind::Dot, "'.'")?;
            let key = self.expect_ident("property name")?;
            return Ok(Operand::Property { variable, key });
        }
        Ok(Operand::Literal(self.parse_literal()?))
    }

    fn parse_literal(&mut self) -> Result<PropertyValue, CypherError> {
        let token = self.peek().clone();
        let value = match &token.kind {
            TokenKind::Str(s) => PropertyValue::String(s.clone()),
            TokenKind::Number(n) => PropertyValue::Number(*n),
            TokenKind::Dash => match &self.peek_at(1).kind {
                TokenKind::Number(n) => {
                    let n = -*n;
                    self.advance();
                    PropertyValue::Number(n)
                }
                _ => return Err(self.error("expected literal value")),
            },
            _ if token.is_keyword("TRUE") => PropertyValue::Bool(true),
            _ if token.is_keyword("FALSE") => PropertyValue::Bool(false),
            _ if token.is_keyword("NULL") => PropertyValue::Null,
            _ => return Err(self.error("expected literal value")),
        };
        self.advance();
        Ok(value)
    }

    /// Position of the first token naming `variable` as an identifier.
    fn position_of(&self, variable: &str) -> usize {
        self.tokens
            .iter()
            .find(|t| matches!(&t.kind, TokenKind::Ident(s) if s == variable))
            .map(|t| t.position)
            .unwrap_or(0)
    }
}

fn validate_variables(query: &CypherQuery, parser: &Parser) -> Result<(), CypherError> {
    let bound: BTreeSet<String> = query.match_patterns.iter().flat_map(|p| p.variables()).collect();

    if let ReturnClause::Variables(vars) = &query.return_clause {
        for var in vars {
            if !bound.contains(var) {
                return Err(CypherError::syntax(
                    parser.position_of(var),
                    format!("variable '{}' is not defined in MATCH", var),
                ));
            }
        }
    }
    if let Some(condition) = &query.where_clause {
        for var in condition.variables() {
            if !bound.contains(&var) {
                return Err(CypherError::syntax(
                    parser.position_of(&var),
                    format!("variable '{}' is not defined in MATCH", var),
                ));
            }
        }
    }
    if let Some(condition) = query.cross_pattern_condition() {
        let vars: Vec<String> = condition.variables().into_iter().collect();
        let position = vars.first().map(|v| parser.position_of(v)).unwrap_or(0);
        return Err(CypherError::syntax(
            position,
            format!("WHERE condition mixes variables of separate MATCH patterns: {}", vars.join(", ")),
        ));
    }
    Ok(())
}
