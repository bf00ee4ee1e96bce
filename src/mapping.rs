//! Mapping of domain objects to directory attribute values.
//!
//! A mapping is a list of rules, each pairing a field path with the name of a
//! directory attribute. Field paths are written in a small language:
//!
//! * `name` reads a field directly. Times are formatted as wire timestamps,
//!   everything else is stringified.
//! * `left+right` expands the collection `left`, resolving `right` against
//!   every element. It produces one value per element.
//! * `left|right` traverses into the nested object `left` and resolves
//!   `right` against it.
//! * `left%right` resolves both sides and joins them with a single space.
//!
//! `+` binds loosest, then `|`, then `%`, so `active_users+user|ldap_full_dn`
//! expands `active_users` and resolves `user|ldap_full_dn` for each element.
//!
//! A path that resolves to nothing is [`Resolution::Absent`] and the
//! attribute is left out of the entry. Asking an object for a field it does not
//! have is a [`MappingError`], it points at a broken mapping rather than at
//! missing data.
use std::{collections::BTreeSet, fmt, str::FromStr};

use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

use crate::{
	config::MappingRule,
	entry::{format_naive_time, format_time, DirectoryEntry, LockTime},
};

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPath {
	/// Read a field directly
	Direct(String),
	/// Resolve both paths and join the results with a space
	Join(Box<FieldPath>, Box<FieldPath>),
	/// Resolve the path against the nested object in the named field
	Traverse(String, Box<FieldPath>),
	/// Resolve the path against every element of the named collection
	Expand(String, Box<FieldPath>),
}

impl FromStr for FieldPath {
	type Err = MappingError;

	fn from_str(path: &str) -> Result<Self, Self::Err> {
		let path = path.trim();
		if let Some((left, right)) = path.split_once('+') {
			return Ok(Self::Expand(field_name(left, path)?, Box::new(right.parse()?)));
		}
		if let Some((left, right)) = path.split_once('|') {
			return Ok(Self::Traverse(field_name(left, path)?, Box::new(right.parse()?)));
		}
		if let Some((left, right)) = path.split_once('%') {
			return Ok(Self::Join(Box::new(left.parse()?), Box::new(right.parse()?)));
		}
		Ok(Self::Direct(field_name(path, path)?))
	}
}

/// Validate a plain field name.
fn field_name(name: &str, path: &str) -> Result<String, MappingError> {
	let name = name.trim();
	if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
		return Err(MappingError::Syntax(path.to_owned()));
	}
	Ok(name.to_owned())
}

impl fmt::Display for FieldPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Direct(name) => write!(f, "{name}"),
			Self::Join(left, right) => write!(f, "{left}%{right}"),
			Self::Traverse(name, rest) => write!(f, "{name}|{rest}"),
			Self::Expand(name, rest) => write!(f, "{name}+{rest}"),
		}
	}
}

/// A field value as returned by a [`Mappable`] object.
pub enum Value<'a> {
	/// Text, written as is
	Text(String),
	/// A number
	Integer(i64),
	/// A point in time
	Time(OffsetDateTime),
	/// A point in time without an offset, treated as UTC
	NaiveTime(PrimitiveDateTime),
	/// An account lock
	Lock(LockTime),
	/// A nested object, for traversal
	Object(Box<dyn Mappable + 'a>),
	/// A collection of objects, for expansion
	Collection(Vec<Box<dyn Mappable + 'a>>),
}

impl fmt::Debug for Value<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
			Self::Integer(number) => f.debug_tuple("Integer").field(number).finish(),
			Self::Time(time) => f.debug_tuple("Time").field(time).finish(),
			Self::NaiveTime(time) => f.debug_tuple("NaiveTime").field(time).finish(),
			Self::Lock(lock) => f.debug_tuple("Lock").field(lock).finish(),
			Self::Object(_) => f.write_str("Object(..)"),
			Self::Collection(items) => write!(f, "Collection({} items)", items.len()),
		}
	}
}

/// A domain object whose fields can be read by name.
pub trait Mappable {
	/// Read a field. `Ok(None)` means the field exists but holds no value;
	/// unknown field names are an error.
	fn field(&self, name: &str) -> Result<Option<Value<'_>>, MappingError>;
}

/// The outcome of resolving a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
	/// Nothing to write; the attribute must be omitted
	Absent,
	/// A single value
	Single(String),
	/// Several values, from an expansion
	Many(Vec<String>),
}

impl Resolution {
	/// The resolved values, empty if absent
	#[must_use]
	pub fn into_values(self) -> Vec<String> {
		match self {
			Self::Absent => Vec::new(),
			Self::Single(value) => vec![value],
			Self::Many(values) => values,
		}
	}
}

/// Resolve a field path against an object.
pub fn resolve(object: &dyn Mappable, path: &FieldPath) -> Result<Resolution, MappingError> {
	match path {
		FieldPath::Direct(name) => match object.field(name)? {
			Some(value) => scalar(name, value),
			None => Ok(Resolution::Absent),
		},
		FieldPath::Join(left, right) => {
			let parts: Vec<String> = [resolve(object, left)?, resolve(object, right)?]
				.into_iter()
				.map(|part| part.into_values().join(" "))
				.filter(|part| !part.is_empty())
				.collect();
			if parts.is_empty() {
				Ok(Resolution::Absent)
			} else {
				Ok(Resolution::Single(parts.join(" ")))
			}
		}
		FieldPath::Traverse(name, rest) => match object.field(name)? {
			Some(Value::Object(inner)) => resolve(inner.as_ref(), rest),
			Some(_) => Err(MappingError::NotAnObject(name.clone())),
			None => Ok(Resolution::Absent),
		},
		FieldPath::Expand(name, rest) => match object.field(name)? {
			Some(Value::Collection(items)) => {
				let mut values = Vec::new();
				for item in &items {
					values.extend(resolve(item.as_ref(), rest)?.into_values());
				}
				if values.is_empty() {
					Ok(Resolution::Absent)
				} else {
					Ok(Resolution::Many(values))
				}
			}
			Some(_) => Err(MappingError::NotACollection(name.clone())),
			None => Ok(Resolution::Absent),
		},
	}
}

/// Turn a directly read value into its wire form.
fn scalar(name: &str, value: Value<'_>) -> Result<Resolution, MappingError> {
	let encoded = match value {
		Value::Text(text) if text.is_empty() => return Ok(Resolution::Absent),
		Value::Text(text) => return Ok(Resolution::Single(text)),
		Value::Integer(number) => return Ok(Resolution::Single(number.to_string())),
		Value::Time(time) => format_time(time),
		Value::NaiveTime(time) => format_naive_time(time),
		Value::Lock(lock) => lock.to_wire(),
		Value::Object(_) | Value::Collection(_) => {
			return Err(MappingError::NotAScalar(name.to_owned()))
		}
	};
	match encoded {
		Ok(value) => Ok(Resolution::Single(value)),
		Err(err) => {
			warn!("Omitting field {name}, it could not be encoded: {err}");
			Ok(Resolution::Absent)
		}
	}
}

/// A compiled list of mapping rules for one kind of entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSpec {
	/// Rules in configuration order
	rules: Vec<(FieldPath, String)>,
}

impl MappingSpec {
	/// Parse the configured rules.
	pub fn compile(rules: &[MappingRule]) -> Result<Self, MappingError> {
		let rules = rules
			.iter()
			.map(|rule| Ok((rule.field.parse()?, rule.attribute.clone())))
			.collect::<Result<_, MappingError>>()?;
		Ok(Self { rules })
	}

	/// Names of all mapped attributes.
	#[must_use]
	pub fn attributes(&self) -> BTreeSet<String> {
		self.rules.iter().map(|(_, attribute)| attribute.clone()).collect()
	}

	/// The attribute a plain field is mapped to, if any.
	#[must_use]
	pub fn attribute_for(&self, field: &str) -> Option<&str> {
		self.rules.iter().find_map(|(path, attribute)| match path {
			FieldPath::Direct(name) if name == field => Some(attribute.as_str()),
			_ => None,
		})
	}

	/// Write every resolvable rule into the entry. Absent values are skipped.
	pub fn apply(
		&self,
		object: &dyn Mappable,
		entry: &mut DirectoryEntry,
	) -> Result<(), MappingError> {
		for (path, attribute) in &self.rules {
			entry.extend_attr(attribute, resolve(object, path)?.into_values());
		}
		Ok(())
	}
}

/// Errors from mappings that cannot work against the objects they are used
/// with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
	/// The field path does not parse
	#[error("Malformed field path `{0}`")]
	Syntax(String),
	/// The object has no field with this name
	#[error("Unknown field `{0}`")]
	UnknownField(String),
	/// A traversal was applied to something other than an object
	#[error("Field `{0}` is not an object")]
	NotAnObject(String),
	/// An expansion was applied to something other than a collection
	#[error("Field `{0}` is not a collection")]
	NotACollection(String),
	/// A nested object or collection was read as a plain value
	#[error("Field `{0}` has no plain value")]
	NotAScalar(String),
}
