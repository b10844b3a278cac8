//! Corpus entries and their byte encoding.
use crate::value::Value;
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use thiserror::Error;

/// One fuzz input plus ancestry metadata.
///
/// `data` is the marshaled form of `values` and is what actually travels
/// through shared memory; `path` is a short content-addressed name derived
/// from `data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorpusEntry {
    /// Content-addressed name: first 4 bytes of SHA-256 of `data`, hex.
    pub path: String,
    /// Marshaled input bytes.
    pub data: Vec<u8>,
    /// Decoded form of `data`, when known.
    pub values: Option<Vec<Value>>,
    /// `path` of the entry this one was derived from.
    pub parent: String,
    /// Mutation distance from the seed corpus.
    pub generation: u64,
    /// Whether this entry came from the seed corpus.
    pub is_seed: bool,
}

impl CorpusEntry {
    /// Builds a seed entry from decoded values, marshaling and naming it.
    pub fn from_values(values: Vec<Value>) -> CorpusEntry {
        let data = marshal_values(&values);
        let path = entry_path(&data);
        CorpusEntry {
            path,
            data,
            values: Some(values),
            parent: String::new(),
            generation: 0,
            is_seed: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("corpus value decoding: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

fn encoding() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Encodes a value vector to its corpus byte form.
pub fn marshal_values(values: &[Value]) -> Vec<u8> {
    bincode::encode_to_vec(values, encoding()).expect("corpus value encoding cannot fail")
}

/// Decodes a corpus byte blob back into values.
pub fn unmarshal_values(data: &[u8]) -> Result<Vec<Value>, CorpusError> {
    let (values, _) = bincode::decode_from_slice(data, encoding())?;
    Ok(values)
}

/// Short content-addressed name for an entry: hex of the first 4 bytes of
/// SHA-256 over the marshaled input.
pub fn entry_path(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut name = String::with_capacity(8);
    for b in &digest[..4] {
        write!(name, "{:02x}", b).unwrap();
    }
    name
}
