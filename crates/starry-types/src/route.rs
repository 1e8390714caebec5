use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// One step of a branch into a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    /// A map key, or a field projected out of every map in a list.
    Key(String),
    /// A list position. Negative values count from the end.
    Index(i64),
    /// A map key followed by a projection onto `fields`.
    Select { key: String, fields: Vec<String> },
}

impl Segment {
    pub fn key(name: impl Into<String>) -> Self {
        Segment::Key(name.into())
    }

    pub fn select<S: Into<String>>(name: impl Into<String>, fields: impl IntoIterator<Item = S>) -> Self {
        Segment::Select {
            key: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => write!(f, "{key}"),
            Segment::Index(index) => write!(f, "{index}"),
            Segment::Select { key, fields } => write!(f, "{key}[{}]", fields.join(",")),
        }
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment::Key(s.to_string())
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Segment::Key(s)
    }
}

impl From<i64> for Segment {
    fn from(index: i64) -> Self {
        Segment::Index(index)
    }
}

impl From<i32> for Segment {
    fn from(index: i32) -> Self {
        Segment::Index(index as i64)
    }
}

/// Address of a document, or of a value nested inside one.
///
/// `key` names the document. `filters` project the addressed value onto a
/// set of map fields. `branch` walks into the document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub key: String,
    pub filters: Vec<String>,
    pub branch: Vec<Segment>,
}

impl Route {
    /// Address a whole document.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            filters: Vec::new(),
            branch: Vec::new(),
        }
    }

    /// Append one branch segment.
    pub fn at(mut self, segment: impl Into<Segment>) -> Self {
        self.branch.push(segment.into());
        self
    }

    /// Project the addressed value onto `fields`.
    pub fn filtered<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.filters = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_whole(&self) -> bool {
        self.branch.is_empty()
    }

    /// The branch rendered as `a.b.0`.
    pub fn branch_display(&self) -> String {
        self.branch
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl From<&str> for Route {
    fn from(key: &str) -> Self {
        Route::new(key)
    }
}

impl From<String> for Route {
    fn from(key: String) -> Self {
        Route::new(key)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if !self.filters.is_empty() {
            write!(f, "[{}]", self.filters.join(","))?;
        }
        for segment in &self.branch {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// Check that a document key maps to a single file inside its depot.
pub fn validate_key(key: &str) -> Result<(), TypeError> {
    if key.is_empty() {
        return Err(TypeError::InvalidKey {
            key: key.to_string(),
            reason: "empty",
        });
    }
    if key.starts_with('.') {
        return Err(TypeError::InvalidKey {
            key: key.to_string(),
            reason: "leading dot",
        });
    }
    if key.contains(['/', '\\', '\0']) {
        return Err(TypeError::InvalidKey {
            key: key.to_string(),
            reason: "path separator or NUL",
        });
    }
    Ok(())
}
