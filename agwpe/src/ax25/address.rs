use bilge::prelude::*;

use crate::callsign::CallSign;
use crate::error::Error;

/// The width, in bytes, of one AX.25 address field on the wire.
pub const ADDRESS_LEN: usize = 7;

/// Maximum number of digipeaters in a path (spec §3).
pub const MAX_DIGIPEATERS: usize = 8;

/// The seventh byte of an AX.25 address field: the end-of-addresses marker, the
/// SSID, two reserved bits (always transmitted as `1`), and a marker bit whose
/// meaning depends on which address field it appears in (command/response for
/// to-/from-address, has-been-repeated for a digipeater).
#[bitsize(8)]
#[derive(FromBits, Clone, Copy)]
struct SsidByte {
	/// End-of-addresses marker: set on the last address field in the path.
	last: bool,
	ssid: u4,
	reserved: u2,
	marker: bool,
}

/// One entry in a digipeater path: a call sign plus whether it has already
/// repeated the packet (the "has-been-repeated" marker from spec §3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Digipeater {
	pub call: CallSign,
	pub repeated: bool,
}

/// An ordered sequence of 0..8 digipeater call signs (spec §3).
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Path(Vec<Digipeater>);

impl Path {
	pub fn new(digis: Vec<Digipeater>) -> Result<Self, Error> {
		if digis.len() > MAX_DIGIPEATERS {
			return Err(Error::ViaPathTooLong);
		}

		Ok(Self(digis))
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Digipeater> {
		self.0.iter()
	}
}

/// Write `call`'s 6-character, left-shifted, space-padded field into `out[..6]`,
/// and the SSID/marker byte into `out[6]`.
fn encode_one(out: &mut [u8; ADDRESS_LEN], call: CallSign, last: bool, marker: bool) {
	let base = call.base().as_bytes();

	for (i, slot) in out[..6].iter_mut().enumerate() {
		let ch = base.get(i).copied().unwrap_or(b' ');
		*slot = ch << 1;
	}

	let byte = SsidByte::new(last, u4::new(call.ssid()), u2::new(0b11), marker);
	out[6] = u8::from(byte);
}

/// Decode one 7-byte address field, returning the call sign, whether it was the
/// last address in the path, and the raw marker bit.
fn decode_one(bytes: &[u8; ADDRESS_LEN]) -> Result<(CallSign, bool, bool), Error> {
	let mut text = String::with_capacity(6);

	for &shifted in &bytes[..6] {
		let ch = (shifted >> 1) as char;

		if ch != ' ' {
			text.push(ch);
		}
	}

	let byte = SsidByte::from(bytes[6]);

	let call = CallSign::parse(&format!("{text}-{}", u8::from(byte.ssid()))).map_err(|_| Error::MalformedPacket("invalid call sign in address field"))?;

	Ok((call, byte.last(), byte.marker()))
}

/// Encode the to-address, from-address, and digipeater path. `command`/`response`
/// set the marker bit on the to-/from-address respectively (spec §3); digipeater
/// marker bits carry each entry's `repeated` flag. Returns the encoded bytes.
pub fn encode_addresses(to: CallSign, from: CallSign, path: &Path, command: bool, response: bool) -> Vec<u8> {
	let mut out = Vec::with_capacity(ADDRESS_LEN * (2 + path.len()));

	let last_is_to_or_from = path.is_empty();

	let mut field = [0u8; ADDRESS_LEN];
	encode_one(&mut field, to, last_is_to_or_from, command);
	out.extend_from_slice(&field);

	encode_one(&mut field, from, last_is_to_or_from, response);
	out.extend_from_slice(&field);

	let last_digi = path.len().saturating_sub(1);

	for (i, digi) in path.iter().enumerate() {
		encode_one(&mut field, digi.call, i == last_digi, digi.repeated);
		out.extend_from_slice(&field);
	}

	out
}

/// Decoded addresses: to, from, digipeater path, and the raw to-/from- marker
/// bits (command/response is derived from these by the caller, since the
/// meaning of the bit is frame-type dependent for S-frames; see spec §4.2).
pub struct DecodedAddresses {
	pub to: CallSign,
	pub from: CallSign,
	pub path: Path,
	pub to_marker: bool,
	pub from_marker: bool,
	/// Number of bytes consumed from the input.
	pub consumed: usize,
}

/// Walk addresses from `buf` until the end-of-addresses bit is seen or bounds
/// are exceeded.
pub fn decode_addresses(buf: &[u8]) -> Result<DecodedAddresses, Error> {
	let mut offset = 0;
	let mut fields = Vec::new();

	loop {
		if fields.len() == 2 + MAX_DIGIPEATERS {
			return Err(Error::MalformedPacket("address path exceeds maximum length"));
		}

		let chunk: &[u8; ADDRESS_LEN] = buf
			.get(offset..offset + ADDRESS_LEN)
			.ok_or(Error::MalformedPacket("truncated address field"))?
			.try_into()
			.expect("slice has exactly ADDRESS_LEN bytes");

		let (call, last, marker) = decode_one(chunk)?;
		offset += ADDRESS_LEN;
		fields.push((call, marker));

		if last {
			break;
		}
	}

	if fields.len() < 2 {
		return Err(Error::MalformedPacket("address path missing to-/from-address"));
	}

	let mut iter = fields.into_iter();
	let (to, to_marker) = iter.next().expect("at least 2 fields");
	let (from, from_marker) = iter.next().expect("at least 2 fields");

	let path = Path::new(iter.map(|(call, repeated)| Digipeater { call, repeated }).collect()).expect("bounded above by MAX_DIGIPEATERS");

	Ok(DecodedAddresses { to, from, path, to_marker, from_marker, consumed: offset })
}
