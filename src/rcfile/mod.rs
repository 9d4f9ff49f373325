// Copyright 2024-2026 the Gantry authors. MIT license.

use std::collections::HashMap;

use monch::*;

use self::ini::Key;
use self::ini::KeyValue;
use self::ini::Value;

mod ini;

pub const RC_FILENAME: &str = ".gantryrc";

/// Credentials and TLS settings for one registry host (keys of the
/// form `//host/path/:_authToken`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
  pub auth: Option<String>,
  pub auth_token: Option<String>,
  pub username: Option<String>,
  pub password: Option<String>,
  pub email: Option<String>,
  pub certfile: Option<String>,
  pub keyfile: Option<String>,
}

/// A plain configuration value from an rc file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RcValue {
  String(String),
  Boolean(bool),
  Number(i64),
}

impl RcValue {
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      RcValue::Boolean(value) => Some(*value),
      RcValue::String(value) => match value.as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
      },
      RcValue::Number(_) => None,
    }
  }

  pub fn as_number(&self) -> Option<i64> {
    match self {
      RcValue::Number(value) => Some(*value),
      RcValue::String(value) => value.parse().ok(),
      RcValue::Boolean(_) => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      RcValue::String(value) => Some(value),
      _ => None,
    }
  }
}

/// The parsed contents of a `.gantryrc` file: flat configuration
/// values plus per-scope registries and per-host credentials.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RcFile {
  pub values: HashMap<String, RcValue>,
  pub scope_registries: HashMap<String, String>,
  pub registry_configs: HashMap<String, RegistryConfig>,
}

impl RcFile {
  /// Overlays another rc file on top of this one (later files win).
  pub fn merge(&mut self, other: RcFile) {
    self.values.extend(other.values);
    self.scope_registries.extend(other.scope_registries);
    for (host, config) in other.registry_configs {
      self.registry_configs.insert(host, config);
    }
  }
}

pub fn parse_rc_file(
  input: &str,
  get_env_var: &impl Fn(&str) -> Option<String>,
) -> Result<RcFile, ParseErrorFailureError> {
  let kvs = ini::parse_ini(input)?;
  let mut rc_file = RcFile::default();

  for KeyValue { key, value } in kvs {
    let Key::Plain(key) = key else {
      // list-valued keys are not consumed by the resolver core
      continue;
    };
    if let Some((left, right)) = key.rsplit_once(':') {
      if let Some(scope) = left.strip_prefix('@') {
        if right == "registry" {
          if let Value::String(text) = &value {
            let registry = expand_vars(text, get_env_var);
            rc_file.scope_registries.insert(scope.to_string(), registry);
          }
        }
        continue;
      }
      if let Some(host_and_path) = left.strip_prefix("//") {
        if let Value::String(text) = &value {
          let text = expand_vars(text, get_env_var);
          let config = rc_file
            .registry_configs
            .entry(host_and_path.to_string())
            .or_default();
          match right {
            "_auth" => config.auth = Some(text),
            "_authToken" => config.auth_token = Some(text),
            "username" => config.username = Some(text),
            "_password" => config.password = Some(text),
            "email" => config.email = Some(text),
            "certfile" => config.certfile = Some(text),
            "keyfile" => config.keyfile = Some(text),
            _ => {}
          }
        }
        continue;
      }
    }
    let rc_value = match value {
      Value::String(text) => RcValue::String(expand_vars(text, get_env_var)),
      Value::Boolean(flag) => RcValue::Boolean(flag),
      Value::Number(number) => RcValue::Number(number),
      Value::Null => continue,
    };
    rc_file.values.insert(key.to_string(), rc_value);
  }

  Ok(rc_file)
}

/// Expands `${VAR}` references against the environment, leaving
/// unknown variables in place.
fn expand_vars(
  input: &str,
  get_env_var: &impl Fn(&str) -> Option<String>,
) -> String {
  fn escaped_char(input: &str) -> ParseResult<char> {
    preceded(ch('\\'), next_char)(input)
  }

  fn env_var(input: &str) -> ParseResult<&str> {
    let (input, _) = tag("${")(input)?;
    let (input, var_name) = take_while(|c| c != '}')(input)?;
    if var_name.chars().any(|c| matches!(c, '$' | '{' | '\\')) {
      return ParseError::backtrace();
    }
    let (input, _) = ch('}')(input)?;
    Ok((input, var_name))
  }

  let (input, results) = many0(or3(
    map(escaped_char, |c| c.to_string()),
    map(env_var, |var_name| {
      get_env_var(var_name)
        .unwrap_or_else(|| format!("${{{var_name}}}"))
    }),
    map(next_char, |c| c.to_string()),
  ))(input)
  .unwrap();
  debug_assert!(input.is_empty());
  results.join("")
}

#[cfg(test)]
mod test {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn parses_full_rc_file() {
    let rc = parse_rc_file(
      r#"
network-concurrency = 12
offline
registry = "https://example.com/registry"
@myorg:registry=https://example.com/myorg
//example.com/:_authToken=${EXAMPLE_TOKEN}
//example.com/myorg/:_authToken=OTHER
//example.com/:username=USER
"#,
      &|name| match name {
        "EXAMPLE_TOKEN" => Some("SECRET".to_string()),
        _ => None,
      },
    )
    .unwrap();

    assert_eq!(
      rc.values.get("network-concurrency"),
      Some(&RcValue::Number(12))
    );
    assert_eq!(rc.values.get("offline"), Some(&RcValue::Boolean(true)));
    assert_eq!(
      rc.values.get("registry"),
      Some(&RcValue::String("https://example.com/registry".to_string()))
    );
    assert_eq!(
      rc.scope_registries.get("myorg").map(String::as_str),
      Some("https://example.com/myorg")
    );
    assert_eq!(
      rc.registry_configs.get("example.com/"),
      Some(&RegistryConfig {
        auth_token: Some("SECRET".to_string()),
        username: Some("USER".to_string()),
        ..Default::default()
      })
    );
    assert_eq!(
      rc.registry_configs
        .get("example.com/myorg/")
        .and_then(|c| c.auth_token.as_deref()),
      Some("OTHER")
    );
  }

  #[test]
  fn unknown_env_vars_are_left_in_place() {
    let rc = parse_rc_file(
      "//example.com/:_authToken=${MISSING}\n",
      &|_| None,
    )
    .unwrap();
    assert_eq!(
      rc.registry_configs
        .get("example.com/")
        .and_then(|c| c.auth_token.as_deref()),
      Some("${MISSING}")
    );
  }

  #[test]
  fn merge_prefers_later_files() {
    let mut base = parse_rc_file("flat = true\notp = \"1\"\n", &|_| None)
      .unwrap();
    let project = parse_rc_file("otp = \"2\"\n", &|_| None).unwrap();
    base.merge(project);
    assert_eq!(base.values.get("flat"), Some(&RcValue::Boolean(true)));
    assert_eq!(
      base.values.get("otp"),
      Some(&RcValue::String("2".to_string()))
    );
  }
}
