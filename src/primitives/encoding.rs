//! Centralized encoding and decoding utilities that define the byte format
//! of every serialized artifact in the crate: views and ragged trims on the
//! wire and in their on-disk slots, and the parameter block exchanged during
//! joins.
//!
//! Currently uses `postcard` as the underlying serialization format.

use {
	bytes::Bytes,
	serde::{Serialize, de::DeserializeOwned},
};

pub fn serialize<T: Serialize>(value: &T) -> Bytes {
	postcard::to_allocvec(value)
		.expect("serialization should never fail")
		.into()
}

pub fn try_serialize<T: Serialize>(
	value: &T,
) -> Result<Bytes, postcard::Error> {
	postcard::to_allocvec(value).map(Bytes::from)
}

pub fn deserialize<T: DeserializeOwned>(
	bytes: impl AsRef<[u8]>,
) -> Result<T, postcard::Error> {
	postcard::from_bytes(bytes.as_ref())
}
