#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum registration token length, counted in Unicode code points.
pub const MAX_USERNAME_CHARS: usize = 50;

/// Identity issued by the directory on registration. `0` means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
	pub const UNSET: UserId = UserId(0);

	pub const fn new(id: i64) -> Self {
		Self(id)
	}

	pub const fn get(self) -> i64 {
		self.0
	}

	pub const fn is_unset(&self) -> bool {
		self.0 == 0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<i64> for UserId {
	fn from(v: i64) -> Self {
		Self(v)
	}
}

/// Errors for registration tokens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsernameError {
	#[error("username is empty")]
	Empty,
	#[error("username too long: {len} characters (max {max})")]
	TooLong { len: usize, max: usize },
	#[error("username contains only whitespace")]
	Blank,
}

/// Validated display name.
///
/// The raw token must be 1..=50 code points long. Interior whitespace runs are
/// collapsed to a single space and the ends are trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
	pub fn parse(raw: &str) -> Result<Self, UsernameError> {
		let len = raw.chars().count();
		if len == 0 {
			return Err(UsernameError::Empty);
		}
		if len > MAX_USERNAME_CHARS {
			return Err(UsernameError::TooLong {
				len,
				max: MAX_USERNAME_CHARS,
			});
		}

		let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
		if normalized.is_empty() {
			return Err(UsernameError::Blank);
		}
		Ok(Self(normalized))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = UsernameError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::parse(s)
	}
}

impl TryFrom<String> for Username {
	type Error = UsernameError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Username::parse(&value)
	}
}

impl From<Username> for String {
	fn from(value: Username) -> Self {
		value.0
	}
}

/// Chat message as it travels on the socket, through the stream and in the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	#[serde(default, skip_serializing_if = "UserId::is_unset")]
	pub user_id: UserId,
	#[serde(default)]
	pub username: String,
	#[serde(default)]
	pub text: String,
}

impl ChatMessage {
	pub fn new(user_id: UserId, username: impl Into<String>, text: impl Into<String>) -> Self {
		Self {
			user_id,
			username: username.into(),
			text: text.into(),
		}
	}

	/// Overwrite the sender fields with the identity bound to the connection.
	pub fn stamp(&mut self, user_id: UserId, username: &Username) {
		self.user_id = user_id;
		self.username = username.as_str().to_string();
	}

	/// Serialize to the JSON payload used on every hop.
	pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(self)
	}

	pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
		serde_json::from_slice(payload)
	}
}

impl fmt::Display for ChatMessage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<{}>: {}", self.username, self.text)
	}
}

/// Body of `POST /register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
	pub username: String,
}

/// Successful response of `POST /register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
	pub user_id: UserId,
}

/// Error body returned by the registration endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: String,
}
