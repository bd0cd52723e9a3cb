use core::fmt;
use core::str::FromStr;

use crate::error::Error;

/// Maximum number of base characters in a call sign (before the optional `-SSID`).
const MAX_BASE: usize = 6;

/// A radio station identifier: up to six ASCII alphanumerics or `/`, optionally
/// followed by `-` and a numeric SSID in `[0,15]`.
///
/// Constructed values are always canonicalized to upper case. Equality is
/// case-insensitive on the base (trivially, since the base is always stored
/// upper-cased) and exact on the SSID.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSign {
	base: [u8; MAX_BASE],
	base_len: u8,
	ssid: u8,
}

impl CallSign {
	/// Validate and construct a call sign from its textual form (`BASE` or `BASE-SSID`).
	pub fn parse(s: &str) -> Result<Self, Error> {
		let (base_str, ssid_str) = match s.split_once('-') {
			Some((b, s)) => (b, Some(s)),
			None => (s, None),
		};

		if base_str.is_empty() || base_str.len() > MAX_BASE {
			return Err(Error::InvalidCallSign(s.to_string()));
		}

		if !base_str.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'/') {
			return Err(Error::InvalidCallSign(s.to_string()));
		}

		let ssid: u8 = match ssid_str {
			None => 0,
			Some(digits) => digits
				.parse()
				.ok()
				.filter(|&n| n <= 15)
				.ok_or_else(|| Error::InvalidSsid(s.to_string()))?,
		};

		let mut base = [0u8; MAX_BASE];
		for (dst, src) in base.iter_mut().zip(base_str.bytes()) {
			*dst = src.to_ascii_uppercase();
		}

		Ok(Self { base, base_len: base_str.len() as u8, ssid })
	}

	/// The base call sign, without the SSID, upper-cased.
	pub fn base(&self) -> &str {
		core::str::from_utf8(&self.base[..self.base_len as usize]).expect("base is ASCII")
	}

	/// The numeric sub-station identifier, in `[0,15]`.
	pub fn ssid(&self) -> u8 {
		self.ssid
	}
}

impl fmt::Display for CallSign {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.base())?;

		if self.ssid != 0 {
			write!(f, "-{}", self.ssid)?;
		}

		Ok(())
	}
}

impl fmt::Debug for CallSign {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CallSign({self})")
	}
}

impl FromStr for CallSign {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_base_only() {
		let call = CallSign::parse("n0call").unwrap();
		assert_eq!(call.base(), "N0CALL");
		assert_eq!(call.ssid(), 0);
		assert_eq!(call.to_string(), "N0CALL");
	}

	#[test]
	fn parses_with_ssid() {
		let call = CallSign::parse("w1aw-5").unwrap();
		assert_eq!(call.base(), "W1AW");
		assert_eq!(call.ssid(), 5);
		assert_eq!(call.to_string(), "W1AW-5");
	}

	#[test]
	fn rejects_bad_characters() {
		assert!(CallSign::parse("N0!ALL").is_err());
	}

	#[test]
	fn rejects_overlong_base() {
		assert!(CallSign::parse("TOOLONGG").is_err());
	}

	#[test]
	fn rejects_out_of_range_ssid() {
		assert!(CallSign::parse("N0CALL-16").is_err());
		assert!(CallSign::parse("N0CALL-99").is_err());
	}

	#[test]
	fn case_insensitive_equality() {
		assert_eq!(CallSign::parse("n0call").unwrap(), CallSign::parse("N0CALL").unwrap());
		assert_ne!(CallSign::parse("N0CALL-1").unwrap(), CallSign::parse("N0CALL-2").unwrap());
	}
}
