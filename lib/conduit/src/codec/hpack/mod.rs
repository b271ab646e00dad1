//! HPACK header compression (RFC 7541).
//!
//! The encoder and decoder each own a dynamic table and are owned by one
//! direction of one channel; they are never shared.

pub mod huffman;
pub mod integer;
pub mod table;

use self::table::{DynamicTable, STATIC_TABLE};
use lumen::shared::{NetworkError, NetworkResult, ProtocolError};

const INDEXED: u8 = 0x80;
const LITERAL_INCREMENTAL: u8 = 0x40;
const SIZE_UPDATE: u8 = 0x20;
const LITERAL_NEVER_INDEXED: u8 = 0x10;
const HUFFMAN: u8 = 0x80;

/// Combined index space: 1..=61 is the static table, 62 onward is the
/// dynamic table, newest first.
const DYNAMIC_BASE: usize = STATIC_TABLE.len() + 1;

/// One header field. `sensitive` fields are never entered into a dynamic
/// table on either side of the connection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Header {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub sensitive: bool,
}

impl Header {
    #[inline]
    pub fn new<N: Into<Vec<u8>>, V: Into<Vec<u8>>>(name: N, value: V) -> Header {
        Header {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    #[inline]
    pub fn sensitive<N: Into<Vec<u8>>, V: Into<Vec<u8>>>(name: N, value: V) -> Header {
        Header {
            name: name.into(),
            value: value.into(),
            sensitive: true,
        }
    }
}

pub struct Encoder {
    table: DynamicTable,
    pending_size_update: Option<usize>,
}

impl Encoder {
    #[inline]
    pub fn new(max_table_size: usize) -> Encoder {
        Encoder {
            table: DynamicTable::new(max_table_size),
            pending_size_update: None,
        }
    }

    #[inline]
    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Adjust the dynamic table bound. Eviction happens immediately; the
    /// size-update representation is emitted at the start of the next
    /// header block.
    pub fn set_max_table_size(&mut self, max_size: usize) {
        self.table.set_max_size(max_size);
        self.pending_size_update = Some(max_size);
    }

    /// Encode a whole header block.
    pub fn encode(&mut self, headers: &[Header]) -> Vec<u8> {
        let mut sink = Vec::new();

        for header in headers {
            self.encode_header(&mut sink, header);
        }

        sink
    }

    /// Encode a single field into `sink`.
    pub fn encode_header(&mut self, sink: &mut Vec<u8>, header: &Header) {
        if let Some(size) = self.pending_size_update.take() {
            integer::encode(sink, SIZE_UPDATE, 5, size);
        }

        if header.sensitive {
            // Never-indexed literal; the dynamic table is left untouched and
            // intermediaries are told not to index either.
            match self.find_name(&header.name) {
                Some(index) => integer::encode(sink, LITERAL_NEVER_INDEXED, 4, index),
                None => {
                    integer::encode(sink, LITERAL_NEVER_INDEXED, 4, 0);
                    Self::encode_string(sink, &header.name);
                }
            }
            Self::encode_string(sink, &header.value);
            return;
        }

        if let Some(index) = self.find_field(&header.name, &header.value) {
            integer::encode(sink, INDEXED, 7, index);
            return;
        }

        match self.find_name(&header.name) {
            Some(index) => integer::encode(sink, LITERAL_INCREMENTAL, 6, index),
            None => {
                integer::encode(sink, LITERAL_INCREMENTAL, 6, 0);
                Self::encode_string(sink, &header.name);
            }
        }
        Self::encode_string(sink, &header.value);

        self.table.insert(header.name.clone(), header.value.clone());
    }

    fn find_field(&self, name: &[u8], value: &[u8]) -> Option<usize> {
        if let Some(position) = STATIC_TABLE
            .iter()
            .position(|(entry_name, entry_value)| *entry_name == name && *entry_value == value)
        {
            return Some(position + 1);
        }

        self.table.find(name, value).map(|index| DYNAMIC_BASE + index)
    }

    fn find_name(&self, name: &[u8]) -> Option<usize> {
        if let Some(position) = STATIC_TABLE.iter().position(|(entry_name, _)| *entry_name == name) {
            return Some(position + 1);
        }

        self.table.find_name(name).map(|index| DYNAMIC_BASE + index)
    }

    /// String literal, Huffman-coded when that is strictly shorter.
    fn encode_string(sink: &mut Vec<u8>, bytes: &[u8]) {
        let coded_len = huffman::encoded_len(bytes);

        if coded_len < bytes.len() {
            integer::encode(sink, HUFFMAN, 7, coded_len);
            sink.extend(huffman::encode(bytes));
        } else {
            integer::encode(sink, 0, 7, bytes.len());
            sink.extend_from_slice(bytes);
        }
    }
}

pub struct Decoder {
    table: DynamicTable,
    max_header_size: usize,
    // Largest table size a size update may request, per the out-of-band
    // protocol settings.
    size_update_ceiling: usize,
    // Unconsumed tail of a representation split across decode calls.
    carry: Vec<u8>,
    seen_field: bool,
}

impl Decoder {
    #[inline]
    pub fn new(max_table_size: usize, max_header_size: usize) -> Decoder {
        Decoder {
            table: DynamicTable::new(max_table_size),
            max_header_size,
            size_update_ceiling: max_table_size,
            carry: Vec::new(),
            seen_field: false,
        }
    }

    #[inline]
    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Apply a protocol-level table-size bound (e.g. from a SETTINGS
    /// exchange). Size updates above this are rejected.
    pub fn set_max_table_size(&mut self, max_size: usize) {
        self.size_update_ceiling = max_size;
        if self.table.max_size() > max_size {
            self.table.set_max_size(max_size);
        }
    }

    /// Decode the supplied octets, emitting each complete field. A
    /// representation cut off at the end of `source` is carried over to the
    /// next call; `end_header_block` reports whether one was left dangling.
    pub fn decode<F: FnMut(Header)>(&mut self, source: &[u8], mut emit: F) -> NetworkResult<()> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(source);

        let mut position = 0;

        while position < data.len() {
            let start = position;

            match self.parse_representation(&data, &mut position, &mut emit) {
                Ok(()) => {}
                Err(NetworkError::Incomplete) => {
                    self.carry = data[start..].to_vec();
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    /// Assert that decoding stopped on a representation boundary and reset
    /// per-block state.
    pub fn end_header_block(&mut self) -> NetworkResult<()> {
        self.seen_field = false;

        if !self.carry.is_empty() {
            self.carry.clear();
            return Err(NetworkError::protocol(ProtocolError::TruncatedBlock));
        }

        Ok(())
    }

    fn parse_representation<F: FnMut(Header)>(
        &mut self,
        data: &[u8],
        position: &mut usize,
        emit: &mut F,
    ) -> NetworkResult<()> {
        let first = data[*position];

        if first & INDEXED != 0 {
            let index = integer::decode(data, position, 7)?;
            let (name, value) = self.resolve(index)?;
            self.seen_field = true;
            emit(Header {
                name,
                value,
                sensitive: false,
            });
        } else if first & LITERAL_INCREMENTAL != 0 {
            let index = integer::decode(data, position, 6)?;
            let name = match index {
                0 => self.read_string(data, position)?,
                _ => self.resolve(index)?.0,
            };
            let value = self.read_string(data, position)?;

            self.table.insert(name.clone(), value.clone());
            self.seen_field = true;
            emit(Header {
                name,
                value,
                sensitive: false,
            });
        } else if first & SIZE_UPDATE != 0 {
            // Only legal in the block prefix, before any field.
            if self.seen_field {
                return Err(NetworkError::protocol(ProtocolError::IllegalSizeUpdate));
            }

            let size = integer::decode(data, position, 5)?;
            if size > self.size_update_ceiling {
                return Err(NetworkError::protocol(ProtocolError::IllegalSizeUpdate));
            }

            self.table.set_max_size(size);
        } else {
            // Literal without indexing (0x00) or never-indexed (0x10); the
            // latter must be reported as sensitive.
            let sensitive = first & LITERAL_NEVER_INDEXED != 0;
            let index = integer::decode(data, position, 4)?;
            let name = match index {
                0 => self.read_string(data, position)?,
                _ => self.resolve(index)?.0,
            };
            let value = self.read_string(data, position)?;

            self.seen_field = true;
            emit(Header {
                name,
                value,
                sensitive,
            });
        }

        Ok(())
    }

    fn resolve(&self, index: usize) -> NetworkResult<(Vec<u8>, Vec<u8>)> {
        if index == 0 {
            return Err(NetworkError::protocol(ProtocolError::InvalidIndex));
        }

        if index < DYNAMIC_BASE {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_vec(), value.to_vec()));
        }

        match self.table.get(index - DYNAMIC_BASE) {
            Some((name, value)) => Ok((name.clone(), value.clone())),
            None => Err(NetworkError::protocol(ProtocolError::InvalidIndex)),
        }
    }

    fn read_string(&self, data: &[u8], position: &mut usize) -> NetworkResult<Vec<u8>> {
        if *position >= data.len() {
            return Err(NetworkError::Incomplete);
        }

        let coded = data[*position] & HUFFMAN != 0;
        let length = integer::decode(data, position, 7)?;

        if length > self.max_header_size {
            return Err(NetworkError::protocol(ProtocolError::HeaderTooLarge));
        }

        if *position + length > data.len() {
            return Err(NetworkError::Incomplete);
        }

        let raw = &data[*position..*position + length];
        *position += length;

        if coded {
            huffman::decode(raw, self.max_header_size)
        } else {
            Ok(raw.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_HEADER: usize = 8192;

    fn decode_all(decoder: &mut Decoder, block: &[u8]) -> Vec<Header> {
        let mut headers = Vec::new();
        decoder.decode(block, |header| headers.push(header)).unwrap();
        decoder.end_header_block().unwrap();
        headers
    }

    #[test]
    fn test_single_header_roundtrip() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        let block = encoder.encode(&[Header::new("someName", "someValue")]);
        let headers = decode_all(&mut decoder, &block);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].name, b"someName");
        assert_eq!(headers[0].value, b"someValue");
        assert!(!headers[0].sensitive);

        // Both sides indexed the field identically.
        assert!(encoder.table().size() > 0);
        assert_eq!(decoder.table().size(), encoder.table().size());
    }

    #[test]
    fn test_sensitive_header_skips_tables() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        let block = encoder.encode(&[Header::sensitive("someName", "someValue")]);
        let headers = decode_all(&mut decoder, &block);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].name, b"someName");
        assert_eq!(headers[0].value, b"someValue");
        assert!(headers[0].sensitive);

        assert_eq!(encoder.table().len(), 0);
        assert_eq!(decoder.table().len(), 0);
    }

    #[test]
    fn test_three_distinct_headers_in_order() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        let sent = vec![
            Header::new("n1", "v1"),
            Header::new("n2", "v2"),
            Header::new("n3", "v3"),
        ];

        let block = encoder.encode(&sent);
        let headers = decode_all(&mut decoder, &block);

        assert_eq!(headers, sent);
    }

    #[test]
    fn test_static_table_exact_match_is_one_octet() {
        let mut encoder = Encoder::new(4096);

        let block = encoder.encode(&[Header::new(":method", "GET")]);

        assert_eq!(block, vec![0x82]);
        assert_eq!(encoder.table().len(), 0);
    }

    #[test]
    fn test_repeated_field_uses_dynamic_index() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        let first = encoder.encode(&[Header::new("x-trace", "abc123")]);
        let second = encoder.encode(&[Header::new("x-trace", "abc123")]);

        // Second occurrence collapses to a single indexed octet.
        assert!(second.len() < first.len());
        assert_eq!(second.len(), 1);

        decode_all(&mut decoder, &first);
        let headers = decode_all(&mut decoder, &second);

        assert_eq!(headers[0].name, b"x-trace");
        assert_eq!(headers[0].value, b"abc123");
    }

    #[test]
    fn test_roundtrip_spread() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        let mut sent = Vec::new();
        for index in 0..40 {
            let name = format!("name-{}", index % 7);
            let value: Vec<u8> = (0..(index * 13 % 300)).map(|byte| byte as u8).collect();
            sent.push(Header {
                name: name.into_bytes(),
                value,
                sensitive: index % 5 == 0,
            });
        }

        let block = encoder.encode(&sent);
        let headers = decode_all(&mut decoder, &block);

        assert_eq!(headers, sent);
        assert_eq!(decoder.table().size(), encoder.table().size());
    }

    #[test]
    fn test_size_update_emitted_at_next_block() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        decode_all(&mut decoder, &encoder.encode(&[Header::new("n1", "v1")]));
        assert!(decoder.table().size() > 0);

        encoder.set_max_table_size(0);
        let block = encoder.encode(&[Header::new("n2", "v2")]);

        // Block leads with the size update representation.
        assert_eq!(block[0] & 0xE0, 0x20);

        let headers = decode_all(&mut decoder, &block);

        assert_eq!(headers[0].name, b"n2");
        assert_eq!(encoder.table().len(), 0);
        assert_eq!(decoder.table().len(), 0);
        assert_eq!(decoder.table().max_size(), 0);
    }

    #[test]
    fn test_size_update_after_field_is_illegal() {
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        // Indexed :method GET, then a size update.
        let block = [0x82, 0x20];
        let result = decoder.decode(&block, |_| {});

        assert_eq!(
            result.unwrap_err(),
            NetworkError::protocol(ProtocolError::IllegalSizeUpdate)
        );
    }

    #[test]
    fn test_size_update_above_ceiling_is_illegal() {
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        let mut block = Vec::new();
        integer::encode(&mut block, 0x20, 5, 1 << 20);

        let result = decoder.decode(&block, |_| {});

        assert_eq!(
            result.unwrap_err(),
            NetworkError::protocol(ProtocolError::IllegalSizeUpdate)
        );
    }

    #[test]
    fn test_invalid_index() {
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        // Index 0 is never assigned.
        assert_eq!(
            decoder.decode(&[0x80], |_| {}).unwrap_err(),
            NetworkError::protocol(ProtocolError::InvalidIndex)
        );

        // Beyond the static table with an empty dynamic table.
        let mut block = Vec::new();
        integer::encode(&mut block, 0x80, 7, 62);
        assert_eq!(
            decoder.decode(&block, |_| {}).unwrap_err(),
            NetworkError::protocol(ProtocolError::InvalidIndex)
        );
    }

    #[test]
    fn test_truncated_block() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        let block = encoder.encode(&[Header::new("someName", "someValue")]);

        let mut headers = Vec::new();
        decoder
            .decode(&block[..block.len() - 2], |header| headers.push(header))
            .unwrap();

        assert!(headers.is_empty());
        assert_eq!(
            decoder.end_header_block().unwrap_err(),
            NetworkError::protocol(ProtocolError::TruncatedBlock)
        );
    }

    #[test]
    fn test_split_block_reassembles_across_calls() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096, MAX_HEADER);

        let block = encoder.encode(&[Header::new("someName", "someValue"), Header::new("n2", "v2")]);

        let mut headers = Vec::new();
        let split = block.len() / 2;
        decoder.decode(&block[..split], |header| headers.push(header)).unwrap();
        decoder.decode(&block[split..], |header| headers.push(header)).unwrap();
        decoder.end_header_block().unwrap();

        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].name, b"n2");
    }

    #[test]
    fn test_header_too_large() {
        let mut decoder = Decoder::new(4096, 16);

        let mut block = Vec::new();
        integer::encode(&mut block, 0x40, 6, 0);
        integer::encode(&mut block, 0, 7, 64);
        block.extend(std::iter::repeat(b'x').take(64));

        assert_eq!(
            decoder.decode(&block, |_| {}).unwrap_err(),
            NetworkError::protocol(ProtocolError::HeaderTooLarge)
        );
    }
}
