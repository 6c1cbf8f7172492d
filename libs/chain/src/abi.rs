//! Solidity ABI encoding.
//!
//! Covers the value shapes the operator's contract calls use: addresses,
//! unsigned integers up to 128 bits, `bytes32`, dynamic `bytes`/`string`,
//! and tuples of those. Decoding is limited to reading static words out of
//! return data and log payloads.

use crate::error::ChainError;
use crate::hash::function_selector;
use crate::types::{Address, H256};

/// A single ABI value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(u128),
    FixedBytes32(H256),
    Bytes(Vec<u8>),
    String(String),
    Tuple(Vec<Token>),
}

impl Token {
    /// Dynamic tokens are encoded in the tail and referenced by offset.
    pub fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::String(_) => true,
            Token::Tuple(items) => items.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    /// Size this token occupies in the head section.
    fn head_size(&self) -> usize {
        match self {
            Token::Tuple(items) if !self.is_dynamic() => items.iter().map(Token::head_size).sum(),
            _ => 32,
        }
    }
}

/// Encodes a uint as a big-endian 32-byte word.
pub fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Encodes a token sequence as a top-level argument list.
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len: usize = tokens.iter().map(Token::head_size).sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
            tail.extend(encode_token(token));
        } else {
            head.extend(encode_token(token));
        }
    }

    head.extend(tail);
    head
}

fn encode_token(token: &Token) -> Vec<u8> {
    match token {
        Token::Address(addr) => {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(addr.as_bytes());
            word.to_vec()
        }
        Token::Uint(value) => uint_word(*value).to_vec(),
        Token::FixedBytes32(h) => h.as_bytes().to_vec(),
        Token::Bytes(bytes) => encode_packed_bytes(bytes),
        Token::String(s) => encode_packed_bytes(s.as_bytes()),
        Token::Tuple(items) => encode(items),
    }
}

fn encode_packed_bytes(bytes: &[u8]) -> Vec<u8> {
    let padded_len = bytes.len().div_ceil(32) * 32;
    let mut out = Vec::with_capacity(32 + padded_len);
    out.extend_from_slice(&uint_word(bytes.len() as u128));
    out.extend_from_slice(bytes);
    out.resize(32 + padded_len, 0);
    out
}

/// Selector followed by the encoded arguments.
pub fn encode_call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = function_selector(signature).to_vec();
    data.extend(encode(tokens));
    data
}

/// Reads the `index`-th 32-byte word of `data`.
pub fn word_at(data: &[u8], index: usize) -> Result<[u8; 32], ChainError> {
    let start = index * 32;
    data.get(start..start + 32)
        .and_then(|w| w.try_into().ok())
        .ok_or_else(|| {
            ChainError::Decode(format!(
                "word {index} out of range for {} bytes of data",
                data.len()
            ))
        })
}

/// Decodes a uint word, rejecting values wider than 128 bits.
pub fn decode_uint(word: &[u8; 32]) -> Result<u128, ChainError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("uint value exceeds 128 bits".to_string()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

/// Decodes an address word, rejecting dirty high bytes.
pub fn decode_address(word: &[u8; 32]) -> Result<Address, ChainError> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("address word has non-zero padding".to_string()));
    }
    Ok(Address::from_word(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    #[test]
    fn test_encode_static_args() {
        let data = encode(&[Token::Address(addr(0x11)), Token::Uint(7)]);
        assert_eq!(data.len(), 64);
        assert_eq!(&data[12..32], &[0x11; 20]);
        assert_eq!(data[63], 7);
    }

    #[test]
    fn test_encode_uint_and_string() {
        // reportError(uint256,string) style arguments
        let data = encode(&[Token::Uint(42), Token::String("QuotaExceeded".into())]);
        assert_eq!(data.len(), 4 * 32);
        assert_eq!(decode_uint(&word_at(&data, 0).unwrap()).unwrap(), 42);
        assert_eq!(decode_uint(&word_at(&data, 1).unwrap()).unwrap(), 0x40);
        assert_eq!(decode_uint(&word_at(&data, 2).unwrap()).unwrap(), 13);
        assert_eq!(&data[96..109], b"QuotaExceeded");
        assert!(data[109..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encode_empty_string() {
        let data = encode(&[Token::String(String::new())]);
        assert_eq!(data.len(), 64);
        assert_eq!(decode_uint(&word_at(&data, 0).unwrap()).unwrap(), 0x20);
        assert_eq!(decode_uint(&word_at(&data, 1).unwrap()).unwrap(), 0);
    }

    #[test]
    fn test_encode_static_tuple_inline() {
        // ((address,address,uint32),string): static tuple sits inline in the head
        let details = Token::Tuple(vec![
            Token::Address(addr(0xaa)),
            Token::Address(Address::ZERO),
            Token::Uint(0),
        ]);
        let data = encode(&[details, Token::String(String::new())]);
        assert_eq!(data.len(), 5 * 32);
        assert_eq!(decode_uint(&word_at(&data, 3).unwrap()).unwrap(), 0x80);
        assert_eq!(decode_uint(&word_at(&data, 4).unwrap()).unwrap(), 0);
    }

    #[test]
    fn test_encode_dynamic_tuple() {
        // ((bytes,bytes32,uint256),address) with a 65-byte signature
        let sig = vec![0x5a; 65];
        let tuple = Token::Tuple(vec![
            Token::Bytes(sig.clone()),
            Token::FixedBytes32(H256::from([0x01; 32])),
            Token::Uint(1_700_003_600),
        ]);
        let data = encode(&[tuple, Token::Address(addr(0x22))]);

        // head: offset(tuple) = 0x40, address
        assert_eq!(decode_uint(&word_at(&data, 0).unwrap()).unwrap(), 0x40);
        assert_eq!(decode_address(&word_at(&data, 1).unwrap()).unwrap(), addr(0x22));
        // tuple head: offset(bytes) = 0x60 relative to tuple start, salt, expiry
        assert_eq!(decode_uint(&word_at(&data, 2).unwrap()).unwrap(), 0x60);
        assert_eq!(word_at(&data, 3).unwrap(), [0x01; 32]);
        assert_eq!(decode_uint(&word_at(&data, 4).unwrap()).unwrap(), 1_700_003_600);
        // bytes: length then 3 padded words
        assert_eq!(decode_uint(&word_at(&data, 5).unwrap()).unwrap(), 65);
        assert_eq!(data.len(), 6 * 32 + 96);
        assert_eq!(&data[192..257], sig.as_slice());
    }

    #[test]
    fn test_encode_call_prefixes_selector() {
        let data = encode_call("transfer(address,uint256)", &[Token::Address(addr(1)), Token::Uint(1)]);
        assert_eq!(hex::encode(&data[..4]), "a9059cbb");
        assert_eq!(data.len(), 4 + 64);
    }

    #[test]
    fn test_decode_uint_overflow() {
        let word = [0xff; 32];
        assert!(decode_uint(&word).is_err());
    }

    #[test]
    fn test_word_at_out_of_range() {
        assert!(word_at(&[0u8; 40], 1).is_err());
    }
}
