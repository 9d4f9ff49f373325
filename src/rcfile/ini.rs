// Copyright 2024-2026 the Gantry authors. MIT license.

// ini parsing for .gantryrc files

use monch::*;

#[derive(Debug, PartialEq, Eq)]
pub struct KeyValue<'a> {
  pub key: Key<'a>,
  pub value: Value<'a>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Key<'a> {
  Plain(&'a str),
  /// `key[] = value` appends to a list.
  Array(&'a str),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Value<'a> {
  String(&'a str),
  Boolean(bool),
  Number(i64),
  Null,
}

pub fn parse_ini(
  input: &str,
) -> Result<Vec<KeyValue>, ParseErrorFailureError> {
  with_failure_handling(|input| {
    let (input, _) = skip_trivia(input)?;
    many0(|input| {
      let (input, kv) = parse_key_value(input)?;
      let (input, _) = skip_trivia(input)?;
      Ok((input, kv))
    })(input)
  })(input)
}

fn parse_key_value(input: &str) -> ParseResult<KeyValue> {
  fn parse_empty_value(input: &str) -> ParseResult<()> {
    let (input, _) = skip_spaces(input)?;
    let (input, _) = skip_comment(input)?;
    if input.is_empty() || input.starts_with('\n') || input.starts_with("\r\n")
    {
      Ok((input, ()))
    } else {
      ParseError::backtrace()
    }
  }

  let (input, key) = parse_key(input)?;
  let (input, _) = skip_spaces(input)?;
  let (input, value) = or(
    |input| {
      let (input, _) = ch('=')(input)?;
      parse_value(input)
    },
    // a bare key is shorthand for enabling a flag
    map(parse_empty_value, |_| Value::Boolean(true)),
  )(input)?;
  Ok((input, KeyValue { key, value }))
}

fn parse_key(input: &str) -> ParseResult<Key> {
  fn parse_unquoted(input: &str) -> ParseResult<Key> {
    let (input, key) =
      take_while_excluding_comment(|c| c != '=' && c != '\n')(input)?;
    let key = key.trim();
    if key.is_empty() {
      return ParseError::backtrace();
    }
    match key.strip_suffix("[]") {
      Some(key) => Ok((input, Key::Array(key))),
      None => Ok((input, Key::Plain(key))),
    }
  }

  or(map(parse_quoted_padded, Key::Plain), parse_unquoted)(input)
}

fn parse_value(input: &str) -> ParseResult<Value> {
  fn parse_unquoted(input: &str) -> ParseResult<Value> {
    let (input, value) =
      take_while_excluding_comment(|c| c != '\n')(input)?;
    let value = value.trim();
    Ok((
      input,
      match value {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        "null" => Value::Null,
        value => match value.parse::<i64>() {
          Ok(number) => Value::Number(number),
          Err(_) => Value::String(value),
        },
      },
    ))
  }

  or(map(parse_quoted_padded, Value::String), parse_unquoted)(input)
}

fn skip_trivia(input: &str) -> ParseResult<()> {
  let mut input = input;
  let mut length = 0;

  while input.len() != length {
    length = input.len();
    input = skip_whitespace(input)?.0;
    input = skip_comment(input)?.0;
  }
  Ok((input, ()))
}

fn parse_quoted_padded(input: &str) -> ParseResult<&str> {
  let (input, _) = skip_spaces(input)?;
  let (input, quote) = or(ch('"'), ch('\''))(input)?;
  let (input, text) = take_while(|c| c != quote && c != '\n')(input)?;
  let (input, _) = ch(quote)(input)?;
  let (input, _) = skip_spaces(input)?;
  Ok((input, text))
}

fn skip_spaces(input: &str) -> ParseResult<()> {
  skip_while(|c| c == ' ' || c == '\t')(input)
}

fn skip_comment(input: &str) -> ParseResult<()> {
  let (input, found) =
    maybe(or(map(ch('#'), |_| ()), map(ch(';'), |_| ())))(input)?;
  if found.is_none() {
    return Ok((input, ()));
  }
  skip_while(|c| c != '\n')(input)
}

fn take_while_excluding_comment<'a>(
  test: impl Fn(char) -> bool,
) -> impl Fn(&'a str) -> ParseResult<'a, &'a str> {
  move |input| {
    let mut last_char = None;
    for (index, c) in input.char_indices() {
      if matches!(c, '#' | ';') && last_char != Some('\\') || !test(c) {
        return Ok((&input[index..], &input[..index]));
      }
      last_char = Some(c);
    }
    Ok(("", input))
  }
}
