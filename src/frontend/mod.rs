pub mod lexer;
pub mod parser;
pub mod parser_error;
pub mod printer;
pub mod token;
pub mod whitespace;

use crate::lang::node::Program;
use crate::options::CompileOptions;

use self::lexer::Lexer;
use self::parser::Parser;
use self::parser_error::ParseError;
use self::whitespace::WhitespaceControl;

/// Tokenize, parse and apply whitespace control.
pub fn parse(source: &str, options: &CompileOptions) -> Result<Program, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut program = Parser::new(tokens).parse()?;
    WhitespaceControl::new(options.ignore_standalone).apply(&mut program);
    Ok(program)
}
