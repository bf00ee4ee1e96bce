//! Attribute level difference between a directory entry and the entry the
//! domain wants it to be.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entry::DirectoryEntry;

/// Attributes the directory maintains itself. They are imported but never
/// written.
pub const VOLATILE_ATTRIBUTES: [&str; 2] = ["authTimestamp", "pwdChangedTime"];

/// A single-value modification of one attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modification {
	/// Add a value
	Add(String, String),
	/// Delete a value
	Delete(String, String),
	/// Replace all values with one value
	Replace(String, String),
}

impl Modification {
	/// The modified attribute
	#[must_use]
	pub fn attribute(&self) -> &str {
		match self {
			Self::Add(attribute, _) | Self::Delete(attribute, _) | Self::Replace(attribute, _) => {
				attribute
			}
		}
	}
}

/// Mapped attributes minus the volatile ones.
#[must_use]
pub fn allowed_attributes(mapped: &BTreeSet<String>) -> BTreeSet<String> {
	mapped
		.iter()
		.filter(|attribute| {
			!VOLATILE_ATTRIBUTES.iter().any(|volatile| volatile.eq_ignore_ascii_case(attribute))
		})
		.cloned()
		.collect()
}

/// Attribute name lower-cased, with the spelling and values of one side.
type Side<'a> = BTreeMap<String, (&'a str, &'a [String])>;

/// Restrict an entry to a set of attributes, keyed case-insensitively.
fn restrict<'a>(entry: &'a DirectoryEntry, allowed: &BTreeSet<String>) -> Side<'a> {
	entry
		.attrs
		.iter()
		.map(|(name, values)| (name.to_ascii_lowercase(), (name.as_str(), values.as_slice())))
		.filter(|(key, _)| allowed.contains(key))
		.collect()
}

/// Compute the modifications turning `current` into `new`.
///
/// Only attributes in `allowed` are compared. Blacklisted attributes are
/// deleted value by value wherever they appear in `current`. Attributes
/// single-valued on both sides are replaced when they differ, all others get
/// one add or delete per differing value so values the domain does not know
/// about are never clobbered by a bulk replace.
#[must_use]
pub fn attribute_diff(
	current: &DirectoryEntry,
	new: &DirectoryEntry,
	allowed: &BTreeSet<String>,
	blacklist: &[String],
) -> Vec<Modification> {
	let blacklist: BTreeSet<String> =
		blacklist.iter().map(|name| name.to_ascii_lowercase()).collect();
	let allowed: BTreeSet<String> = allowed
		.iter()
		.map(|name| name.to_ascii_lowercase())
		.filter(|name| !blacklist.contains(name))
		.collect();

	let mut modifications = Vec::new();
	for (spelling, values) in restrict(current, &blacklist).into_values() {
		modifications.extend(
			values.iter().map(|value| Modification::Delete(spelling.to_owned(), value.clone())),
		);
	}

	let current = restrict(current, &allowed);
	let new = restrict(new, &allowed);
	let names: BTreeSet<&String> = current.keys().chain(new.keys()).collect();
	for name in names {
		match (current.get(name), new.get(name)) {
			(Some((spelling, values)), None) => modifications.extend(values.iter().map(|value| {
				Modification::Delete((*spelling).to_owned(), value.clone())
			})),
			(None, Some((spelling, values))) => modifications.extend(
				values.iter().map(|value| Modification::Add((*spelling).to_owned(), value.clone())),
			),
			(Some((_, [old])), Some((spelling, [value]))) => {
				if old != value {
					let spelling = (*spelling).to_owned();
					modifications.push(Modification::Replace(spelling, value.clone()));
				}
			}
			(Some((_, old)), Some((spelling, values))) => {
				modifications.extend(
					old.iter()
						.filter(|value| !values.contains(*value))
						.map(|value| Modification::Delete((*spelling).to_owned(), value.clone())),
				);
				modifications.extend(
					values
						.iter()
						.filter(|value| !old.contains(*value))
						.map(|value| Modification::Add((*spelling).to_owned(), value.clone())),
				);
			}
			(None, None) => {}
		}
	}
	modifications
}
