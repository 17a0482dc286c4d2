//! Formula compilation.
//!
//! [`Compile`] is the seam the calculator talks to: a formula string turns
//! into an optional aggregation kind and row functions. [`Parser`] is the
//! default compiler, an arithmetic language over column names:
//!
//! ```text
//! formula := aggregation '(' expr? ')' | expr
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | atom
//! atom    := number | string | column | '(' expr ')'
//! ```

use std::sync::Arc;

use crate::aggregation::AggregationKind;
use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::frame::Row;
use crate::schema::Schema;

pub type RowFunction = Arc<dyn Fn(&Row) -> std::result::Result<Cell, String> + Send + Sync>;

pub struct Compiled {
	pub aggregation: Option<AggregationKind>,
	pub functions: Vec<RowFunction>,
}

pub trait Compile: Send + Sync {
	fn compile(&self, formula: &str, schema: &Schema) -> Result<Compiled>;

	/// Compiles `formula` and runs it against `row` when the row is not
	/// empty, so references and types are checked against real data.
	fn validate(&self, formula: &str, schema: &Schema, row: &Row) -> Result<Option<AggregationKind>> {
		let compiled = self.compile(formula, schema)?;
		if !row.is_empty() {
			for function in &compiled.functions {
				function(row).map_err(Error::Formula)?;
			}
		}
		Ok(compiled.aggregation)
	}
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
	Literal(Cell),
	Column(String),
	Neg(Box<Expr>),
	Binary(Op, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
	Add,
	Sub,
	Mul,
	Div,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
	Int(i64),
	Float(f64),
	Str(String),
	Ident(String),
	Op(Op),
	Open,
	Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
	let mut tokens = Vec::new();
	let mut chars = input.char_indices().peekable();

	while let Some(&(pos, c)) = chars.peek() {
		match c {
			c if c.is_whitespace() => {
				chars.next();
			}
			'+' | '-' | '*' | '/' => {
				chars.next();
				tokens.push(Token::Op(match c {
					'+' => Op::Add,
					'-' => Op::Sub,
					'*' => Op::Mul,
					_ => Op::Div,
				}));
			}
			'(' => {
				chars.next();
				tokens.push(Token::Open);
			}
			')' => {
				chars.next();
				tokens.push(Token::Close);
			}
			'"' | '\'' => {
				chars.next();
				let mut text = String::new();
				loop {
					match chars.next() {
						Some((_, q)) if q == c => break,
						Some((_, ch)) => text.push(ch),
						None => return Err(Error::Formula(format!("unterminated string at {pos}"))),
					}
				}
				tokens.push(Token::Str(text));
			}
			c if c.is_ascii_digit() || c == '.' => {
				let mut number = String::new();
				while let Some(&(_, d)) = chars.peek() {
					if d.is_ascii_digit() || d == '.' {
						number.push(d);
						chars.next();
					} else {
						break;
					}
				}
				let token = match number.parse::<i64>() {
					Ok(i) => Token::Int(i),
					Err(_) => Token::Float(
						number
							.parse::<f64>()
							.map_err(|_| Error::Formula(format!("bad number `{number}`")))?,
					),
				};
				tokens.push(token);
			}
			c if c.is_alphabetic() || c == '_' => {
				let mut ident = String::new();
				while let Some(&(_, d)) = chars.peek() {
					if d.is_alphanumeric() || d == '_' {
						ident.push(d);
						chars.next();
					} else {
						break;
					}
				}
				tokens.push(Token::Ident(ident));
			}
			other => {
				return Err(Error::Formula(format!("unexpected `{other}` at {pos}")));
			}
		}
	}

	Ok(tokens)
}

struct Cursor<'a> {
	tokens: &'a [Token],
	pos: usize,
	schema: &'a Schema,
}

impl<'a> Cursor<'a> {
	fn peek(&self) -> Option<&'a Token> {
		self.tokens.get(self.pos)
	}

	fn next(&mut self) -> Option<&'a Token> {
		let token = self.tokens.get(self.pos);
		self.pos += 1;
		token
	}

	fn expect_close(&mut self) -> Result<()> {
		match self.next() {
			Some(Token::Close) => Ok(()),
			_ => Err(Error::Formula("expected `)`".into())),
		}
	}

	fn expr(&mut self) -> Result<Expr> {
		let mut left = self.term()?;
		while let Some(Token::Op(op @ (Op::Add | Op::Sub))) = self.peek() {
			self.pos += 1;
			left = Expr::Binary(*op, Box::new(left), Box::new(self.term()?));
		}
		Ok(left)
	}

	fn term(&mut self) -> Result<Expr> {
		let mut left = self.unary()?;
		while let Some(Token::Op(op @ (Op::Mul | Op::Div))) = self.peek() {
			self.pos += 1;
			left = Expr::Binary(*op, Box::new(left), Box::new(self.unary()?));
		}
		Ok(left)
	}

	fn unary(&mut self) -> Result<Expr> {
		if let Some(Token::Op(Op::Sub)) = self.peek() {
			self.pos += 1;
			return Ok(Expr::Neg(Box::new(self.unary()?)));
		}
		self.atom()
	}

	fn atom(&mut self) -> Result<Expr> {
		match self.next() {
			Some(Token::Int(i)) => Ok(Expr::Literal(Cell::Int(*i))),
			Some(Token::Float(f)) => Ok(Expr::Literal(Cell::Float(*f))),
			Some(Token::Str(s)) => Ok(Expr::Literal(Cell::Text(s.clone()))),
			Some(Token::Ident(name)) => {
				if let Some(Token::Open) = self.peek() {
					return Err(Error::Formula(format!(
						"`{name}(...)` is only allowed as the outermost call"
					)));
				}
				let slug = self
					.schema
					.labels_to_slugs()
					.get(name)
					.cloned()
					.unwrap_or_else(|| name.clone());
				Ok(Expr::Column(slug))
			}
			Some(Token::Open) => {
				let inner = self.expr()?;
				self.expect_close()?;
				Ok(inner)
			}
			Some(other) => Err(Error::Formula(format!("unexpected token {other:?}"))),
			None => Err(Error::Formula("unexpected end of formula".into())),
		}
	}

	fn finish(&self) -> Result<()> {
		match self.peek() {
			None => Ok(()),
			Some(token) => Err(Error::Formula(format!("trailing token {token:?}"))),
		}
	}
}

fn arithmetic(op: Op, a: Cell, b: Cell) -> std::result::Result<Cell, String> {
	if a.is_null() || b.is_null() {
		return Ok(Cell::Null);
	}
	let value = match (op, &a, &b) {
		(Op::Add, Cell::Text(x), Cell::Text(y)) => Cell::Text(format!("{x}{y}")),
		(_, Cell::Int(x), Cell::Int(y)) if op != Op::Div => {
			let result = match op {
				Op::Add => x.checked_add(*y),
				Op::Sub => x.checked_sub(*y),
				_ => x.checked_mul(*y),
			};
			match result {
				Some(i) => Cell::Int(i),
				None => return Err(format!("integer overflow in {a} {op:?} {b}")),
			}
		}
		_ if a.is_numeric() && b.is_numeric() => {
			let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
			match op {
				Op::Add => Cell::Float(x + y),
				Op::Sub => Cell::Float(x - y),
				Op::Mul => Cell::Float(x * y),
				Op::Div if y == 0.0 => Cell::Null,
				Op::Div => Cell::Float(x / y),
			}
		}
		_ => return Err(format!("cannot apply {op:?} to {a} and {b}")),
	};
	Ok(value)
}

fn eval(expr: &Expr, row: &Row) -> std::result::Result<Cell, String> {
	match expr {
		Expr::Literal(cell) => Ok(cell.clone()),
		Expr::Column(name) => row
			.get(name)
			.cloned()
			.ok_or_else(|| format!("unknown column `{name}`")),
		Expr::Neg(inner) => match eval(inner, row)? {
			Cell::Null => Ok(Cell::Null),
			Cell::Int(i) => Ok(Cell::Int(-i)),
			Cell::Float(f) => Ok(Cell::Float(-f)),
			other => Err(format!("cannot negate {other}")),
		},
		Expr::Binary(op, a, b) => arithmetic(*op, eval(a, row)?, eval(b, row)?),
	}
}

/// Default formula compiler.
#[derive(Clone, Copy, Debug, Default)]
pub struct Parser;

impl Parser {
	fn parse(&self, formula: &str, schema: &Schema) -> Result<(Option<AggregationKind>, Expr)> {
		let tokens = tokenize(formula)?;
		let mut cursor = Cursor {
			tokens: &tokens,
			pos: 0,
			schema,
		};

		if let (Some(Token::Ident(name)), Some(Token::Open)) = (tokens.first(), tokens.get(1)) {
			let kind = AggregationKind::from_name(name)
				.ok_or_else(|| Error::Formula(format!("unknown aggregation `{name}`")))?;
			cursor.pos = 2;
			let expr = if let (AggregationKind::Count, Some(Token::Close)) = (kind, cursor.peek()) {
				Expr::Literal(Cell::Int(1))
			} else {
				cursor.expr()?
			};
			cursor.expect_close()?;
			cursor.finish()?;
			return Ok((Some(kind), expr));
		}

		let expr = cursor.expr()?;
		cursor.finish()?;
		Ok((None, expr))
	}
}

impl Compile for Parser {
	fn compile(&self, formula: &str, schema: &Schema) -> Result<Compiled> {
		let (aggregation, expr) = self.parse(formula, schema)?;
		let expr = Arc::new(expr);
		let function: RowFunction = Arc::new(move |row: &Row| eval(&expr, row));
		Ok(Compiled {
			aggregation,
			functions: vec![function],
		})
	}
}
