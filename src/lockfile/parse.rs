// Copyright 2024-2026 the Gantry authors. MIT license.

// lockfile text format parsing

use std::collections::BTreeMap;

use monch::*;
use thiserror::Error;

/// A parsed lockfile value. Nested maps keep file order so that
/// re-serialization is stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockValue {
  Str(String),
  Bool(bool),
  Map(Vec<(String, LockValue)>),
}

impl LockValue {
  pub fn get(&self, key: &str) -> Option<&LockValue> {
    match self {
      LockValue::Map(entries) => {
        entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
      }
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      LockValue::Str(value) => Some(value),
      _ => None,
    }
  }
}

/// How the lockfile text was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseKind {
  Success,
  /// The input contained merge conflict markers and both sides parsed;
  /// the result is the union of their entries.
  Merge,
  /// Reconciliation failed; the result is best-effort and callers must
  /// warn.
  Conflict,
}

#[derive(Debug, Error)]
#[error("Failed parsing lockfile on line {line}: {message}")]
pub struct LockfileParseError {
  pub line: usize,
  pub message: String,
}

#[derive(Debug)]
pub struct ParsedLockfile {
  pub kind: ParseKind,
  pub object: BTreeMap<String, LockValue>,
}

pub fn parse_lockfile(
  text: &str,
) -> Result<ParsedLockfile, LockfileParseError> {
  if !has_merge_conflicts(text) {
    return Ok(ParsedLockfile {
      kind: ParseKind::Success,
      object: parse_document(text)?,
    });
  }

  let (ours, theirs) = extract_conflict_variants(text);
  Ok(match (parse_document(&ours), parse_document(&theirs)) {
    (Ok(mut ours), Ok(theirs)) => {
      // union of entries; the incoming side wins a key collision,
      // matching how textual merges leave the newer value last
      for (key, value) in theirs {
        ours.insert(key, value);
      }
      ParsedLockfile {
        kind: ParseKind::Merge,
        object: ours,
      }
    }
    (Ok(object), Err(_)) | (Err(_), Ok(object)) => ParsedLockfile {
      kind: ParseKind::Conflict,
      object,
    },
    (Err(_), Err(_)) => ParsedLockfile {
      kind: ParseKind::Conflict,
      object: BTreeMap::new(),
    },
  })
}

fn has_merge_conflicts(text: &str) -> bool {
  text.lines().any(|line| line.starts_with("<<<<<<<"))
}

/// Splits conflicted text into the two full-file variants a textual
/// merge produced.
fn extract_conflict_variants(text: &str) -> (String, String) {
  enum Side {
    Both,
    Ours,
    Theirs,
  }
  let mut side = Side::Both;
  let mut ours = String::new();
  let mut theirs = String::new();
  for line in text.lines() {
    if line.starts_with("<<<<<<<") {
      side = Side::Ours;
    } else if line.starts_with("=======") {
      side = Side::Theirs;
    } else if line.starts_with(">>>>>>>") {
      side = Side::Both;
    } else {
      match side {
        Side::Both => {
          ours.push_str(line);
          ours.push('\n');
          theirs.push_str(line);
          theirs.push('\n');
        }
        Side::Ours => {
          ours.push_str(line);
          ours.push('\n');
        }
        Side::Theirs => {
          theirs.push_str(line);
          theirs.push('\n');
        }
      }
    }
  }
  (ours, theirs)
}

struct Line<'a> {
  indent: usize,
  text: &'a str,
  number: usize,
}

enum LineItem {
  /// `key:` or `key1, key2:` opening an indented block.
  BlockStart(Vec<String>),
  /// `key value`.
  Scalar(String, LockValue),
}

fn parse_document(
  text: &str,
) -> Result<BTreeMap<String, LockValue>, LockfileParseError> {
  let mut lines = Vec::new();
  for (index, raw) in text.lines().enumerate() {
    let trimmed = raw.trim_start_matches(' ');
    if trimmed.is_empty() || trimmed.starts_with('#') {
      continue;
    }
    if trimmed.starts_with('\t') {
      return Err(LockfileParseError {
        line: index + 1,
        message: "tabs are not allowed for indentation".to_string(),
      });
    }
    lines.push(Line {
      indent: raw.len() - trimmed.len(),
      text: trimmed,
      number: index + 1,
    });
  }

  let mut pos = 0;
  let entries = parse_block(&lines, &mut pos, 0)?;
  if pos < lines.len() {
    return Err(LockfileParseError {
      line: lines[pos].number,
      message: "unexpected indentation".to_string(),
    });
  }
  Ok(entries.into_iter().collect())
}

fn parse_block(
  lines: &[Line],
  pos: &mut usize,
  indent: usize,
) -> Result<Vec<(String, LockValue)>, LockfileParseError> {
  let mut entries = Vec::new();
  while *pos < lines.len() {
    let line = &lines[*pos];
    if line.indent < indent {
      break;
    }
    if line.indent > indent {
      return Err(LockfileParseError {
        line: line.number,
        message: "unexpected indentation".to_string(),
      });
    }
    match parse_line(line.text).map_err(|message| LockfileParseError {
      line: line.number,
      message,
    })? {
      LineItem::BlockStart(keys) => {
        *pos += 1;
        let value = if *pos < lines.len() && lines[*pos].indent > indent {
          let child_indent = lines[*pos].indent;
          LockValue::Map(parse_block(lines, pos, child_indent)?)
        } else {
          LockValue::Map(Vec::new())
        };
        for key in keys {
          entries.push((key, value.clone()));
        }
      }
      LineItem::Scalar(key, value) => {
        entries.push((key, value));
        *pos += 1;
      }
    }
  }
  Ok(entries)
}

fn parse_line(text: &str) -> Result<LineItem, String> {
  with_failure_handling(|input| or(parse_block_start, parse_scalar)(input))(
    text,
  )
  .map_err(|err| format!("{err:#}"))
}

fn parse_block_start(input: &str) -> ParseResult<LineItem> {
  let (input, first) = parse_token(input)?;
  let (input, rest) = many0(|input| {
    let (input, _) = ch(',')(input)?;
    let (input, _) = skip_spaces(input)?;
    parse_token(input)
  })(input)?;
  let (input, _) = ch(':')(input)?;
  let (input, _) = skip_spaces(input)?;
  if !input.is_empty() {
    return ParseError::backtrace();
  }
  let mut keys = Vec::with_capacity(1 + rest.len());
  keys.push(token_text(first));
  keys.extend(rest.into_iter().map(token_text));
  Ok((input, LineItem::BlockStart(keys)))
}

fn parse_scalar(input: &str) -> ParseResult<LineItem> {
  let (input, key) = parse_token(input)?;
  let (input, _) = skip_spaces(input)?;
  let (input, token) = parse_token(input)?;
  let (input, _) = skip_spaces(input)?;
  if !input.is_empty() {
    return ParseError::fail(input, "trailing characters after value");
  }
  let value = match token {
    Token::Quoted(text) => LockValue::Str(text),
    Token::Bare(text) => match text.as_str() {
      "true" => LockValue::Bool(true),
      "false" => LockValue::Bool(false),
      _ => LockValue::Str(text),
    },
  };
  Ok((input, LineItem::Scalar(token_text(key), value)))
}

enum Token {
  Quoted(String),
  Bare(String),
}

fn token_text(token: Token) -> String {
  match token {
    Token::Quoted(text) | Token::Bare(text) => text,
  }
}

fn parse_token(input: &str) -> ParseResult<Token> {
  or(
    map(parse_quoted_string, Token::Quoted),
    map(parse_bare_token, Token::Bare),
  )(input)
}

fn parse_bare_token(input: &str) -> ParseResult<String> {
  let (input, text) = if_not_empty(take_while(|c| {
    !matches!(c, ',' | ':' | '"' | ' ' | '\t')
  }))(input)?;
  Ok((input, text.to_string()))
}

/// Parses a JSON-quoted string, honoring escapes.
fn parse_quoted_string(input: &str) -> ParseResult<String> {
  if !input.starts_with('"') {
    return ParseError::backtrace();
  }
  let mut escaped = false;
  for (index, c) in input.char_indices().skip(1) {
    if escaped {
      escaped = false;
    } else if c == '\\' {
      escaped = true;
    } else if c == '"' {
      let end = index + 1;
      return match serde_json::from_str::<String>(&input[..end]) {
        Ok(text) => Ok((&input[end..], text)),
        Err(err) => ParseError::fail(input, format!("invalid string: {err}")),
      };
    }
  }
  ParseError::fail(input, "unterminated string")
}

fn skip_spaces(input: &str) -> ParseResult<()> {
  skip_while(|c| c == ' ' || c == '\t')(input)
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  fn map(entries: Vec<(&str, LockValue)>) -> LockValue {
    LockValue::Map(
      entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect(),
    )
  }

  fn s(text: &str) -> LockValue {
    LockValue::Str(text.to_string())
  }

  #[test]
  fn parses_basic_document() {
    let parsed = parse_lockfile(
      r#"# This file is generated by gantry.
# lockfile v1

a@^1.0.0:
  version "1.1.0"
  resolved "https://registry.gantry.dev/a/-/a-1.1.0.tgz#abc"
  integrity sha512-deadbeef
  dependencies:
    b "^2.0.0"

b@^2.0.0, b@~2.1.0:
  version "2.1.3"
"#,
    )
    .unwrap();
    assert_eq!(parsed.kind, ParseKind::Success);
    assert_eq!(
      parsed.object,
      BTreeMap::from([
        (
          "a@^1.0.0".to_string(),
          map(vec![
            ("version", s("1.1.0")),
            (
              "resolved",
              s("https://registry.gantry.dev/a/-/a-1.1.0.tgz#abc")
            ),
            ("integrity", s("sha512-deadbeef")),
            ("dependencies", map(vec![("b", s("^2.0.0"))])),
          ])
        ),
        (
          "b@^2.0.0".to_string(),
          map(vec![("version", s("2.1.3"))])
        ),
        (
          "b@~2.1.0".to_string(),
          map(vec![("version", s("2.1.3"))])
        ),
      ])
    );
  }

  #[test]
  fn parses_quoted_keys_and_booleans() {
    let parsed = parse_lockfile(
      r#""@scope/a@^1.0.0":
  version "1.0.0"
  permissions:
    scripts true
    preinstall false
"#,
    )
    .unwrap();
    let entry = parsed.object.get("@scope/a@^1.0.0").unwrap();
    let permissions = entry.get("permissions").unwrap();
    assert_eq!(permissions.get("scripts"), Some(&LockValue::Bool(true)));
    assert_eq!(permissions.get("preinstall"), Some(&LockValue::Bool(false)));
  }

  #[test]
  fn parses_top_level_alias() {
    let parsed = parse_lockfile(
      r#"a@^1.0.0:
  version "1.0.0"

a@^1.1.0 "a@^1.0.0"
"#,
    )
    .unwrap();
    assert_eq!(parsed.object.get("a@^1.1.0"), Some(&s("a@^1.0.0")));
  }

  #[test]
  fn reconciles_merge_conflicts_by_union() {
    let parsed = parse_lockfile(
      r#"a@^1.0.0:
  version "1.0.0"
<<<<<<< HEAD
b@^2.0.0:
  version "2.0.0"
=======
c@^3.0.0:
  version "3.0.0"
>>>>>>> theirs
"#,
    )
    .unwrap();
    assert_eq!(parsed.kind, ParseKind::Merge);
    assert_eq!(
      parsed.object.keys().collect::<Vec<_>>(),
      vec!["a@^1.0.0", "b@^2.0.0", "c@^3.0.0"]
    );
  }

  #[test]
  fn irreconcilable_conflict_is_best_effort() {
    let parsed = parse_lockfile(
      r#"a@^1.0.0:
  version "1.0.0"
<<<<<<< HEAD
b@^2.0.0:
  version "2.0.0"
=======
    %%% not parseable %%% :::
>>>>>>> theirs
"#,
    )
    .unwrap();
    assert_eq!(parsed.kind, ParseKind::Conflict);
    // the parseable side survives
    assert!(parsed.object.contains_key("a@^1.0.0"));
    assert!(parsed.object.contains_key("b@^2.0.0"));
  }

  #[test]
  fn rejects_bad_indentation() {
    let err = parse_lockfile("a@^1.0.0:\n      version \"1.0.0\"\n   x y\n")
      .unwrap_err();
    assert_eq!(err.line, 3);
  }
}
