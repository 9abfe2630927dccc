//! Avro single-datum encoding, as used on the import pipeline topics.
//!
//! Messages carry a bare binary datum: no object container header and no
//! schema fingerprint. Both sides must agree on the writer schema.

use std::marker::PhantomData;

use apache_avro::{from_avro_datum, from_value, to_avro_datum, to_value, Schema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid avro schema: {0}")]
    Schema(apache_avro::Error),
    #[error("failed to encode avro datum: {0}")]
    Encode(apache_avro::Error),
    #[error("failed to decode avro datum: {0}")]
    Decode(apache_avro::Error),
    #[error("{0} trailing bytes after avro datum")]
    TrailingBytes(usize),
}

/// Typed codec for one record schema.
pub struct AvroCodec<T> {
    schema: Schema,
    _record: PhantomData<fn() -> T>,
}

impl<T> AvroCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(schema: &str) -> Result<Self, CodecError> {
        let schema = Schema::parse_str(schema).map_err(CodecError::Schema)?;
        Ok(Self {
            schema,
            _record: PhantomData,
        })
    }

    pub fn encode(&self, record: &T) -> Result<Vec<u8>, CodecError> {
        let value = to_value(record).map_err(CodecError::Encode)?;
        to_avro_datum(&self.schema, value).map_err(CodecError::Encode)
    }

    pub fn decode(&self, mut payload: &[u8]) -> Result<T, CodecError> {
        let value = from_avro_datum(&self.schema, &mut payload, None).map_err(CodecError::Decode)?;
        if !payload.is_empty() {
            return Err(CodecError::TrailingBytes(payload.len()));
        }
        from_value::<T>(&value).map_err(CodecError::Decode)
    }
}
