//! Runtime Value Model
//!
//! Values that flow along workflow edges during execution:
//!
//! - [`Value`]: scalars, files, arrays, and the explicit unset sentinel
//! - [`FileValue`]: a primary path plus its attached secondary files
//! - [`ValueType`]: declared input/output types, including optionality

use serde::{Deserialize, Serialize};

/// Declared type of a task or workflow input.
///
/// Optional variants accept an absent value, which resolves to the
/// declared default or to [`Value::Unset`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    File,
    Array,
    Scalar,
    OptionalFile,
    OptionalArray,
    OptionalScalar,
}

/// The underlying kind of a [`ValueType`], optionality stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    File,
    Array,
    Scalar,
}

impl ValueType {
    /// Returns the kind with optionality stripped.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::File | Self::OptionalFile => ValueKind::File,
            Self::Array | Self::OptionalArray => ValueKind::Array,
            Self::Scalar | Self::OptionalScalar => ValueKind::Scalar,
        }
    }

    /// Returns true if an absent value is acceptable for this type.
    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            Self::OptionalFile | Self::OptionalArray | Self::OptionalScalar
        )
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Array => write!(f, "array"),
            Self::Scalar => write!(f, "scalar"),
        }
    }
}

/// A file flowing through the graph: one primary path and the companion
/// paths derived from it.
///
/// Secondary paths are attached once, at the point the file is produced,
/// and travel unchanged along edges. Consumers never re-derive them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileValue {
    /// Path to the primary file
    pub primary: String,

    /// Companion paths (indexes, dictionaries) derived from the primary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary: Vec<String>,
}

impl FileValue {
    /// Creates a file value with no secondary files.
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: Vec::new(),
        }
    }

    /// Sets the secondary paths.
    pub fn with_secondary(mut self, secondary: Vec<String>) -> Self {
        self.secondary = secondary;
        self
    }

    /// Returns the primary path followed by all secondary paths.
    pub fn all_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.secondary.iter().map(String::as_str))
    }
}

/// A runtime value bound to a task input or produced by a task output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
    /// An optional input that was not provided and has no default.
    ///
    /// Distinct from an empty array or empty string: an unset optional
    /// file input must never become an empty path.
    Unset,
    /// A plain scalar (string, number, boolean)
    Scalar(serde_json::Value),
    /// A file with its secondary files attached
    File(FileValue),
    /// An ordered collection of values
    Array(Vec<Value>),
}

impl Value {
    /// Convenience constructor for string scalars.
    pub fn string(s: impl Into<String>) -> Self {
        Self::Scalar(serde_json::Value::String(s.into()))
    }

    /// Convenience constructor for a file value without secondaries.
    pub fn file(primary: impl Into<String>) -> Self {
        Self::File(FileValue::new(primary))
    }

    /// Returns the kind of this value, or `None` for [`Value::Unset`].
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Unset => None,
            Self::Scalar(_) => Some(ValueKind::Scalar),
            Self::File(_) => Some(ValueKind::File),
            Self::Array(_) => Some(ValueKind::Array),
        }
    }

    /// Returns true if this is the unset sentinel.
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Returns the file value if this is a file.
    pub fn as_file(&self) -> Option<&FileValue> {
        match self {
            Self::File(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the elements if this is an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the scalar payload as a string, if this is a string scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(v) => v.as_str(),
            _ => None,
        }
    }

    /// Renders this value for command-line placeholder substitution.
    ///
    /// Files render as their primary path, arrays as space-separated
    /// elements, and unset values as the empty string.
    pub fn to_command_string(&self) -> String {
        match self {
            Self::Unset => String::new(),
            Self::Scalar(v) => match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            },
            Self::File(f) => f.primary.clone(),
            Self::Array(items) => items
                .iter()
                .map(Value::to_command_string)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_kind() {
        assert_eq!(ValueType::File.kind(), ValueKind::File);
        assert_eq!(ValueType::OptionalFile.kind(), ValueKind::File);
        assert_eq!(ValueType::Array.kind(), ValueKind::Array);
        assert_eq!(ValueType::OptionalScalar.kind(), ValueKind::Scalar);
    }

    #[test]
    fn test_value_type_optionality() {
        assert!(!ValueType::File.is_optional());
        assert!(ValueType::OptionalFile.is_optional());
        assert!(ValueType::OptionalArray.is_optional());
        assert!(!ValueType::Scalar.is_optional());
    }

    #[test]
    fn test_file_value_all_paths() {
        let file = FileValue::new("sample.bam").with_secondary(vec!["sample.bam.bai".to_string()]);

        let paths: Vec<&str> = file.all_paths().collect();
        assert_eq!(paths, vec!["sample.bam", "sample.bam.bai"]);
    }

    #[test]
    fn test_value_kinds() {
        assert_eq!(Value::Unset.kind(), None);
        assert_eq!(Value::string("x").kind(), Some(ValueKind::Scalar));
        assert_eq!(Value::file("a.bam").kind(), Some(ValueKind::File));
        assert_eq!(Value::Array(Vec::new()).kind(), Some(ValueKind::Array));
    }

    #[test]
    fn test_unset_is_not_empty_array() {
        assert!(Value::Unset.is_unset());
        assert!(!Value::Array(Vec::new()).is_unset());
        assert_ne!(Value::Unset, Value::Array(Vec::new()));
    }

    #[test]
    fn test_command_string_scalar() {
        assert_eq!(Value::string("hello").to_command_string(), "hello");

        let number = Value::Scalar(serde_json::json!(4));
        assert_eq!(number.to_command_string(), "4");
    }

    #[test]
    fn test_command_string_file_uses_primary() {
        let file = Value::File(
            FileValue::new("ref.fasta").with_secondary(vec!["ref.fasta.fai".to_string()]),
        );
        assert_eq!(file.to_command_string(), "ref.fasta");
    }

    #[test]
    fn test_command_string_array_space_joined() {
        let array = Value::Array(vec![Value::string("a.bed"), Value::string("b.bed")]);
        assert_eq!(array.to_command_string(), "a.bed b.bed");
    }

    #[test]
    fn test_command_string_unset_is_empty() {
        assert_eq!(Value::Unset.to_command_string(), "");
    }
}
