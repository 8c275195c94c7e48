//! Shape and mutation definitions.
//!
//! A shape describes a remote-syncable set of rows: the table it mirrors, the
//! URL template used to request its change-stream and how special column
//! types are parsed. Shapes are defined once and never mutated.

mod parsers;
mod row;
pub(crate) mod stream;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::error::{SyncError, SyncResult};

pub use parsers::default_parsers;
pub use row::{merge_row, row_key, Row};
pub use stream::Txid;

/// Request parameters substituted into a shape's URL template.
pub type Params = BTreeMap<String, String>;

/// Parses the raw string value of a column into JSON.
pub type FieldParser = Arc<dyn Fn(&str) -> serde_json::Value + Send + Sync>;

/// Build `Params` from string pairs.
pub fn params<I, K, V>(pairs: I) -> Params
where
  I: IntoIterator<Item = (K, V)>,
  K: Into<String>,
  V: Into<String>,
{
  pairs
    .into_iter()
    .map(|(k, v)| (k.into(), v.into()))
    .collect()
}

/// Descriptor of a remote-syncable entity set.
#[derive(Clone)]
pub struct ShapeDefinition {
  table: String,
  url: String,
  parsers: HashMap<String, FieldParser>,
}

impl ShapeDefinition {
  /// Create a shape for `table`, requested at `url`.
  ///
  /// `url` may contain `{param}` placeholders. The default field parsers are
  /// installed; see [`default_parsers`].
  pub fn new(table: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      table: table.into(),
      url: url.into(),
      parsers: default_parsers(),
    }
  }

  /// Register a parser for columns of `type_name`.
  pub fn with_parser<F>(mut self, type_name: impl Into<String>, parser: F) -> Self
  where
    F: Fn(&str) -> serde_json::Value + Send + Sync + 'static,
  {
    self.parsers.insert(type_name.into(), Arc::new(parser));
    self
  }

  pub fn table(&self) -> &str {
    &self.table
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn parser(&self, type_name: &str) -> Option<&FieldParser> {
    self.parsers.get(type_name)
  }

  /// Substitute `{name}` tokens with URL-encoded values from `params`.
  pub fn render_url(&self, params: &Params) -> SyncResult<String> {
    let mut rendered = String::with_capacity(self.url.len());
    let mut rest = self.url.as_str();

    while let Some(start) = rest.find('{') {
      rendered.push_str(&rest[..start]);
      let after = &rest[start + 1..];
      let end = after.find('}').ok_or_else(|| {
        SyncError::new(format!("Unterminated parameter in shape url '{}'", self.url))
      })?;

      let name = &after[..end];
      let value = params.get(name).ok_or_else(|| {
        SyncError::new(format!(
          "Missing required parameter '{}' for shape '{}'",
          name, self.table
        ))
      })?;
      rendered.push_str(&urlencoding::encode(value));
      rest = &after[end + 1..];
    }
    rendered.push_str(rest);

    Ok(rendered)
  }
}

impl fmt::Debug for ShapeDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut parsers: Vec<&String> = self.parsers.keys().collect();
    parsers.sort();
    f.debug_struct("ShapeDefinition")
      .field("table", &self.table)
      .field("url", &self.url)
      .field("parsers", &parsers)
      .finish()
  }
}

/// Write endpoint paired with a shape. Without one a collection is read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationDefinition {
  /// Base URL for create (`POST url`), update and delete (`url/{key}`)
  pub url: String,
  /// Logical entity name used in error messages
  pub name: String,
}

impl MutationDefinition {
  pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      name: name.into(),
    }
  }
}

/// Append `path` to `base` (`{base}{path}`), or parse it as-is when absolute.
pub(crate) fn resolve_url(base: &Url, path: &str) -> SyncResult<Url> {
  if path.starts_with("http://") || path.starts_with("https://") {
    return Url::parse(path).map_err(|e| SyncError::new(format!("Invalid url '{}': {}", path, e)));
  }

  let base = base.as_str().trim_end_matches('/');
  let joined = if path.starts_with('/') {
    format!("{}{}", base, path)
  } else {
    format!("{}/{}", base, path)
  };

  Url::parse(&joined).map_err(|e| SyncError::new(format!("Invalid url '{}': {}", joined, e)))
}
