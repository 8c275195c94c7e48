//! Change-stream wire format.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{Row, ShapeDefinition};

/// Server-issued transaction id.
pub type Txid = i64;

pub(crate) const HANDLE_HEADER: &str = "electric-handle";
pub(crate) const OFFSET_HEADER: &str = "electric-offset";
pub(crate) const SCHEMA_HEADER: &str = "electric-schema";

/// One entry of a shape response body.
#[derive(Debug, Deserialize)]
pub(crate) struct Message {
  #[serde(default)]
  pub value: Option<Row>,
  #[serde(default)]
  pub headers: MessageHeaders,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MessageHeaders {
  pub operation: Option<Operation>,
  pub control: Option<Control>,
  #[serde(default)]
  pub txids: Vec<Txid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Operation {
  Insert,
  Update,
  Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Control {
  UpToDate,
  MustRefetch,
  #[serde(other)]
  Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ColumnSchema {
  #[serde(rename = "type")]
  pub type_name: String,
}

/// Column name to column type, as announced by the schema header.
pub(crate) type Schema = HashMap<String, ColumnSchema>;

/// Where the next shape request resumes from.
#[derive(Debug, Clone)]
pub(crate) struct StreamPosition {
  pub offset: String,
  pub handle: Option<String>,
  pub live: bool,
  pub cache_buster: Option<String>,
  pub schema: Schema,
}

impl StreamPosition {
  pub fn initial() -> Self {
    Self {
      offset: "-1".to_string(),
      handle: None,
      live: false,
      cache_buster: None,
      schema: Schema::new(),
    }
  }

  pub fn with_cache_buster(mut self, cache_buster: String) -> Self {
    self.cache_buster = Some(cache_buster);
    self
  }

  /// Query parameters for the next request.
  pub fn query(&self) -> Vec<(&'static str, String)> {
    let mut query = vec![("offset", self.offset.clone())];
    if let Some(handle) = &self.handle {
      query.push(("handle", handle.clone()));
    }
    if self.live {
      query.push(("live", "true".to_string()));
    }
    if let Some(cache_buster) = &self.cache_buster {
      query.push(("cache-buster", cache_buster.clone()));
    }
    query
  }
}

/// Apply the shape's field parsers to string values, by column type.
pub(crate) fn parse_values(row: &mut Row, schema: &Schema, shape: &ShapeDefinition) {
  for (column, value) in row.iter_mut() {
    let Some(parser) = schema
      .get(column)
      .and_then(|column| shape.parser(&column.type_name))
    else {
      continue;
    };
    if let Value::String(raw) = &*value {
      let parsed = parser(raw);
      *value = parsed;
    }
  }
}
