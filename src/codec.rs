//! MsgPack codec using `rmp-serde`.
//!
//! Used for response payloads and for documents held by the in-memory
//! document server. Structs are always encoded as maps (`to_vec_named`), so
//! stored documents keep their field names.
//!
//! # Example
//!
//! ```
//! use yieldpoint::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::Bytes;
use serde_json::Value;

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map format).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Snapshot a JSON value into immutable bytes.
    pub fn freeze(value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(Self::encode(value)?))
    }

    /// Rebuild a JSON value from a snapshot made by [`MsgPackCodec::freeze`].
    pub fn thaw(bytes: &Bytes) -> Result<Value> {
        Self::decode(bytes)
    }
}
