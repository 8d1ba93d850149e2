use std::{fs, path::Path};

use saphyr::{LoadableYamlNode, ScalarOwned, YamlOwned};

use crate::core::parsers::ParserError;

fn key_node(key: &str) -> YamlOwned {
  YamlOwned::Value(ScalarOwned::String(key.to_string()))
}

fn wrong_type(key: &str, node: &YamlOwned, expected: &str) -> ParserError {
  ParserError::WrongType(format!("{}: {:?}", key, node), expected.to_string())
}

pub fn yaml_lookup<'a>(node: &'a YamlOwned, key: &str) -> Option<&'a YamlOwned> {
  match node {
    YamlOwned::Mapping(map) => map.get(&key_node(key)),
    _ => None,
  }
}

pub fn lookup_str(yaml: &YamlOwned, key: &str) -> Result<String, ParserError> {
  let node = yaml_lookup(yaml, key).ok_or_else(|| ParserError::MissingKey(key.to_string()))?;
  node
    .as_str()
    .map(str::to_string)
    .ok_or_else(|| wrong_type(key, node, "string"))
}

pub fn lookup_optional_str(yaml: &YamlOwned, key: &str) -> Result<Option<String>, ParserError> {
  match yaml_lookup(yaml, key) {
    Some(_) => lookup_str(yaml, key).map(Some),
    None => Ok(None),
  }
}

pub fn as_i32(key: &str, node: &YamlOwned) -> Result<i32, ParserError> {
  match node {
    YamlOwned::Value(ScalarOwned::Integer(i)) => {
      i32::try_from(*i).map_err(|_| ParserError::InvalidValue(format!("{}: {} is out of range", key, i)))
    }
    _ => Err(wrong_type(key, node, "integer")),
  }
}

pub fn lookup_i32(yaml: &YamlOwned, key: &str) -> Result<i32, ParserError> {
  let node = yaml_lookup(yaml, key).ok_or_else(|| ParserError::MissingKey(key.to_string()))?;
  as_i32(key, node)
}

pub fn lookup_optional_i32(yaml: &YamlOwned, key: &str) -> Result<Option<i32>, ParserError> {
  yaml_lookup(yaml, key)
    .map(|node| as_i32(key, node))
    .transpose()
}

/// Absent keys read as `false`.
pub fn lookup_flag(yaml: &YamlOwned, key: &str) -> Result<bool, ParserError> {
  match yaml_lookup(yaml, key) {
    None => Ok(false),
    Some(YamlOwned::Value(ScalarOwned::Boolean(b))) => Ok(*b),
    Some(node) => Err(wrong_type(key, node, "boolean")),
  }
}

pub fn lookup_sequence<'a>(
  yaml: &'a YamlOwned,
  key: &str,
) -> Result<&'a Vec<YamlOwned>, ParserError> {
  match yaml_lookup(yaml, key) {
    Some(YamlOwned::Sequence(seq)) => Ok(seq),
    Some(node) => Err(wrong_type(key, node, "sequence")),
    None => Err(ParserError::MissingKey(key.to_string())),
  }
}

pub fn as_i32_sequence(key: &str, node: &YamlOwned) -> Result<Vec<i32>, ParserError> {
  match node {
    YamlOwned::Sequence(seq) => seq.iter().map(|item| as_i32(key, item)).collect(),
    _ => Err(wrong_type(key, node, "sequence of integers")),
  }
}

pub fn lookup_i32_sequence(yaml: &YamlOwned, key: &str) -> Result<Vec<i32>, ParserError> {
  let node = yaml_lookup(yaml, key).ok_or_else(|| ParserError::MissingKey(key.to_string()))?;
  as_i32_sequence(key, node)
}

pub fn load_yaml_from_str(text: &str) -> Result<YamlOwned, ParserError> {
  YamlOwned::load_from_str(text)?
    .into_iter()
    .next()
    .ok_or(ParserError::YamlEmpty)
}

/// Loads the first document of a YAML file.
pub fn load_yaml_from_file(path: &Path) -> Result<YamlOwned, ParserError> {
  load_yaml_from_str(&fs::read_to_string(path)?)
}
