//! # Datasets
//!
//! The columnar batch type flowing between runners. A [`Dataset`] is an
//! opaque, immutable-by-convention batch with a width (columns) and a
//! length (rows). Runners never mutate a dataset they received; they build
//! new ones. The type system here is deliberately small: runners declare
//! the column [`Type`]s they produce, with [`Type::Wildcard`] standing for
//! "determined at runtime".

use serde::{Deserialize, Serialize};

/// Declared type of a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
  /// Any type, determined at runtime.
  Wildcard,
  /// UTF-8 strings.
  Str,
  /// Untyped placeholder rows.
  Null,
}

impl Type {
  /// Whether a produced column of type `other` satisfies this declaration.
  #[must_use]
  pub fn accepts(&self, other: Type) -> bool {
    matches!(self, Type::Wildcard) || *self == other
  }
}

/// One column of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
  /// A column of strings.
  Strs(Vec<String>),
  /// A column of `len` null rows.
  Nulls(usize),
}

impl Column {
  /// Number of rows in this column.
  #[must_use]
  pub fn len(&self) -> usize {
    match self {
      Column::Strs(values) => values.len(),
      Column::Nulls(len) => *len,
    }
  }

  /// Whether the column has no rows.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The concrete type of this column.
  #[must_use]
  pub fn data_type(&self) -> Type {
    match self {
      Column::Strs(_) => Type::Str,
      Column::Nulls(_) => Type::Null,
    }
  }

  fn append(&mut self, other: Column) -> crate::error::Result<()> {
    match (self, other) {
      (Column::Strs(values), Column::Strs(more)) => {
        values.extend(more);
        Ok(())
      }
      (Column::Nulls(len), Column::Nulls(more)) => {
        *len += more;
        Ok(())
      }
      (ours, theirs) => Err(crate::error::Error::Message(format!(
        "cannot append {:?} column to {:?} column",
        theirs.data_type(),
        ours.data_type()
      ))),
    }
  }
}

/// An immutable columnar batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset {
  columns: Vec<Column>,
}

impl Dataset {
  /// Creates a dataset from its columns.
  #[must_use]
  pub fn new(columns: Vec<Column>) -> Self {
    Self { columns }
  }

  /// Convenience constructor for a single string column.
  #[must_use]
  pub fn strs<I, S>(values: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self::new(vec![Column::Strs(
      values.into_iter().map(Into::into).collect(),
    )])
  }

  /// Number of columns.
  #[must_use]
  pub fn width(&self) -> usize {
    self.columns.len()
  }

  /// Number of rows, taken from the first column.
  #[must_use]
  pub fn len(&self) -> usize {
    self.columns.first().map_or(0, Column::len)
  }

  /// Whether the dataset has no rows.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The column at `index`, if present.
  #[must_use]
  pub fn column(&self, index: usize) -> Option<&Column> {
    self.columns.get(index)
  }

  /// All columns.
  #[must_use]
  pub fn columns(&self) -> &[Column] {
    &self.columns
  }

  /// Consumes the dataset, yielding its columns.
  #[must_use]
  pub fn into_columns(self) -> Vec<Column> {
    self.columns
  }

  /// Vertically appends `other`, column by column.
  ///
  /// Appending to an empty dataset adopts the other's columns; otherwise
  /// widths and column types must match.
  pub fn append(&mut self, other: Dataset) -> crate::error::Result<()> {
    if self.columns.is_empty() {
      self.columns = other.columns;
      return Ok(());
    }
    if self.width() != other.width() {
      return Err(crate::error::Error::Message(format!(
        "cannot append dataset of width {} to dataset of width {}",
        other.width(),
        self.width()
      )));
    }
    for (ours, theirs) in self.columns.iter_mut().zip(other.columns) {
      ours.append(theirs)?;
    }
    Ok(())
  }
}
