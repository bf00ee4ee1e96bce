//! Directory entries and the wire forms of the values stored in them.
use std::collections::BTreeMap;

use ldap3::SearchEntry;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::{
	config::{LOCK_SENTINEL, TIME_FORMAT},
	error::Error,
};

/// A directory entry: a distinguished name and its attributes, each holding
/// an ordered list of string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
	/// The distinguished name of the entry
	pub dn: String,
	/// Attribute values keyed by attribute name
	pub attrs: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
	/// Create an entry without any attributes.
	#[must_use]
	pub fn new(dn: impl Into<String>) -> Self {
		Self { dn: dn.into(), attrs: BTreeMap::new() }
	}

	/// Look up the values of an attribute. Attribute names are compared
	/// case-insensitively, as the directory does.
	#[must_use]
	pub fn values(&self, attr: &str) -> Option<&[String]> {
		if let Some(values) = self.attrs.get(attr) {
			return Some(values.as_slice());
		}
		self.attrs
			.iter()
			.find(|(name, _)| name.eq_ignore_ascii_case(attr))
			.map(|(_, values)| values.as_slice())
	}

	/// Get the first value of an attribute.
	#[must_use]
	pub fn attr_first(&self, attr: &str) -> Option<&str> {
		self.values(attr)?.first().map(String::as_str)
	}

	/// Get the first value of an attribute, parsed as a wire timestamp.
	#[must_use]
	pub fn time_first(&self, attr: &str) -> Option<Result<OffsetDateTime, Error>> {
		self.attr_first(attr).map(parse_time)
	}

	/// Append values to an attribute, skipping values it already holds. Empty
	/// value lists never create the attribute.
	pub fn extend_attr(&mut self, attr: &str, values: impl IntoIterator<Item = String>) {
		let mut values = values.into_iter().filter(|value| !value.is_empty()).peekable();
		if values.peek().is_none() {
			return;
		}
		let existing = self.attrs.entry(attr.to_owned()).or_default();
		for value in values {
			if !existing.contains(&value) {
				existing.push(value);
			}
		}
	}

	/// Replace an attribute's values entirely.
	pub fn set_attr(&mut self, attr: &str, values: Vec<String>) {
		self.remove_attr(attr);
		self.extend_attr(attr, values);
	}

	/// Remove an attribute, returning its values if it was present.
	pub fn remove_attr(&mut self, attr: &str) -> Option<Vec<String>> {
		let key = self.attrs.keys().find(|name| name.eq_ignore_ascii_case(attr)).cloned()?;
		self.attrs.remove(&key)
	}
}

impl From<SearchEntry> for DirectoryEntry {
	fn from(entry: SearchEntry) -> Self {
		Self { dn: entry.dn, attrs: entry.attrs.into_iter().collect() }
	}
}

/// Format a point in time in the fixed `YYYYMMDDHHMMSSZ` form, in UTC with
/// whole seconds.
pub fn format_time(time: OffsetDateTime) -> Result<String, Error> {
	let time = time.to_offset(UtcOffset::UTC);
	let time = time.replace_nanosecond(0).map_err(|err| Error::Invalid(err.to_string()))?;
	time.format(&TIME_FORMAT).map_err(|err| Error::Invalid(err.to_string()))
}

/// Format a time without an offset, treating it as UTC.
pub fn format_naive_time(time: PrimitiveDateTime) -> Result<String, Error> {
	format_time(time.assume_utc())
}

/// Parse a wire timestamp.
pub fn parse_time(value: &str) -> Result<OffsetDateTime, Error> {
	PrimitiveDateTime::parse(value, &TIME_FORMAT)
		.map(PrimitiveDateTime::assume_utc)
		.map_err(|err| Error::Invalid(format!("{value}: {err}")))
}

/// The value of an account lock as the directory reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockTime {
	/// Locked without further detail, marked by the minimal sentinel value.
	Sentinel,
	/// Locked by the password policy at the given time.
	At(OffsetDateTime),
}

impl LockTime {
	/// Parse a lock attribute value. Returns `None` for values that are
	/// neither the sentinel nor a wire timestamp.
	#[must_use]
	pub fn parse(value: &str) -> Option<Self> {
		if value == LOCK_SENTINEL {
			return Some(Self::Sentinel);
		}
		parse_time(value).ok().map(Self::At)
	}

	/// The value written to the directory.
	pub fn to_wire(self) -> Result<String, Error> {
		match self {
			Self::Sentinel => Ok(LOCK_SENTINEL.to_owned()),
			Self::At(time) => format_time(time),
		}
	}

	/// The time the lock was placed, if known.
	#[must_use]
	pub fn time(self) -> Option<OffsetDateTime> {
		match self {
			Self::Sentinel => None,
			Self::At(time) => Some(time),
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use time::macros::datetime;

	use super::{format_time, parse_time, DirectoryEntry, LockTime};

	#[test]
	fn attr_first() {
		let mut entry = DirectoryEntry::new("dontcare");
		entry.extend_attr("name", [String::from("Foo Bar"), String::from("Bar McBaz")]);
		assert_eq!(
			entry.attr_first("attribute_does_not_exist"),
			None,
			"Undefined attributes should return None"
		);
		assert_eq!(entry.attr_first("name"), Some("Foo Bar"), "Should return the first value");
		assert_eq!(entry.attr_first("NAME"), Some("Foo Bar"), "Names are case-insensitive");
	}

	#[test]
	fn empty_values_are_never_stored() {
		let mut entry = DirectoryEntry::new("cn=x");
		entry.extend_attr("mail", [String::new()]);
		assert!(entry.values("mail").is_none());

		entry.extend_attr("member", ["a".to_owned(), "a".to_owned(), "b".to_owned()]);
		assert_eq!(entry.values("member").unwrap(), ["a", "b"]);
	}

	#[test]
	fn wire_time() -> Result<(), Box<dyn std::error::Error>> {
		let time = datetime!(2017-07-04 19:37:45.250 +2);
		assert_eq!(format_time(time)?, "20170704173745Z");
		assert_eq!(parse_time("20170704173745Z")?, datetime!(2017-07-04 17:37:45 UTC));
		assert!(parse_time("2017-07-04").is_err());
		Ok(())
	}

	#[test]
	fn lock_sentinel_round_trips() -> Result<(), Box<dyn std::error::Error>> {
		assert_eq!(LockTime::parse("000001010000Z"), Some(LockTime::Sentinel));
		assert_eq!(LockTime::Sentinel.to_wire()?, "000001010000Z");
		assert_eq!(
			LockTime::parse("20200101000000Z"),
			Some(LockTime::At(datetime!(2020-01-01 00:00 UTC)))
		);
		assert_eq!(LockTime::parse("garbage"), None);
		Ok(())
	}
}
