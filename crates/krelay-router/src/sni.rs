//! TLS ClientHello parsing and SNI extraction (spec §4.3).
//!
//! This is the one bit-exact wire surface outside the proxied HTTP traffic
//! itself: callers hand us the raw bytes read off an accepted connection
//! (at least the first TLS record, ideally the whole ClientHello) and get
//! back the hostname carried by the `server_name` extension, or a reason
//! the record couldn't be parsed.

use thiserror::Error;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("first byte is not a TLS handshake content type")]
    NotTlsHandshake,
    #[error("TLS record is malformed or truncated")]
    Malformed,
    #[error("ClientHello carries no server_name extension")]
    NotFound,
}

/// Parses a single TLS record and, if it is a ClientHello carrying a
/// `server_name` extension, returns the host name it names.
///
/// A pure function of the input bytes: identical inputs always yield
/// identical outputs (spec §8).
pub fn extract_sni(record: &[u8]) -> Result<String, SniError> {
    if record.is_empty() {
        return Err(SniError::Malformed);
    }
    if record[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotTlsHandshake);
    }
    if record.len() < 5 {
        return Err(SniError::Malformed);
    }

    let fragment_len = u16::from_be_bytes([record[3], record[4]]) as usize;
    let handshake = &record[5..];
    if fragment_len > handshake.len() {
        return Err(SniError::Malformed);
    }
    let handshake = &handshake[..fragment_len];

    if handshake.len() < 4 || handshake[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(SniError::Malformed);
    }
    let body_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    let body = &handshake[4..];
    if body_len > body.len() {
        return Err(SniError::Malformed);
    }
    let body = &body[..body_len];

    let mut offset = 0usize;

    // client_version(2) + random(32)
    if body.len() < offset + 34 {
        return Err(SniError::Malformed);
    }
    offset += 34;

    // session_id: 1-byte length prefix
    let session_id_len = *body.get(offset).ok_or(SniError::Malformed)? as usize;
    offset += 1;
    offset = offset
        .checked_add(session_id_len)
        .filter(|&o| o <= body.len())
        .ok_or(SniError::Malformed)?;

    // cipher_suites: 2-byte length prefix
    let cipher_suites_len = read_u16(body, offset)? as usize;
    offset += 2;
    offset = offset
        .checked_add(cipher_suites_len)
        .filter(|&o| o <= body.len())
        .ok_or(SniError::Malformed)?;

    // compression_methods: 1-byte length prefix
    let compression_len = *body.get(offset).ok_or(SniError::Malformed)? as usize;
    offset += 1;
    offset = offset
        .checked_add(compression_len)
        .filter(|&o| o <= body.len())
        .ok_or(SniError::Malformed)?;

    // extensions: 2-byte length prefix
    if offset == body.len() {
        // No extensions block present at all.
        return Err(SniError::NotFound);
    }
    let extensions_len = read_u16(body, offset)? as usize;
    offset += 2;
    let extensions_end = offset
        .checked_add(extensions_len)
        .filter(|&e| e <= body.len())
        .ok_or(SniError::Malformed)?;

    while offset + 4 <= extensions_end {
        let ext_type = read_u16(body, offset)?;
        let ext_len = read_u16(body, offset + 2)? as usize;
        offset += 4;
        let ext_end = offset
            .checked_add(ext_len)
            .filter(|&e| e <= extensions_end)
            .ok_or(SniError::Malformed)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(&body[offset..ext_end]);
        }
        offset = ext_end;
    }

    Err(SniError::NotFound)
}

fn parse_server_name_extension(data: &[u8]) -> Result<String, SniError> {
    // server_name_list: 2-byte length prefix
    let list_len = read_u16(data, 0)? as usize;
    if 2 + list_len > data.len() {
        return Err(SniError::Malformed);
    }
    let mut offset = 2;
    let list_end = 2 + list_len;

    while offset + 3 <= list_end {
        let name_type = data[offset];
        let name_len = read_u16(data, offset + 1)? as usize;
        offset += 3;
        let name_end = offset
            .checked_add(name_len)
            .filter(|&e| e <= list_end)
            .ok_or(SniError::Malformed)?;

        if name_type == NAME_TYPE_HOST_NAME {
            let name = std::str::from_utf8(&data[offset..name_end])
                .map_err(|_| SniError::Malformed)?
                .to_string();
            if name.is_empty() {
                return Err(SniError::Malformed);
            }
            return Ok(name);
        }
        offset = name_end;
    }

    Err(SniError::NotFound)
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, SniError> {
    let bytes = data.get(offset..offset + 2).ok_or(SniError::Malformed)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClientHelloBuilder {
        body: Vec<u8>,
        extensions: Vec<u8>,
    }

    impl ClientHelloBuilder {
        fn new() -> Self {
            let mut body = Vec::new();
            body.extend_from_slice(&[0x03, 0x03]); // client_version
            body.extend_from_slice(&[0u8; 32]); // random
            body.push(0); // session_id_len
            body.extend_from_slice(&[0x00, 0x02]); // cipher_suites_len
            body.extend_from_slice(&[0x00, 0x2f]); // one cipher suite
            body.push(1); // compression_methods_len
            body.push(0); // null compression
            Self {
                body,
                extensions: Vec::new(),
            }
        }

        fn with_sni(mut self, host: &str) -> Self {
            let mut server_name = Vec::new();
            server_name.push(NAME_TYPE_HOST_NAME);
            server_name.extend_from_slice(&(host.len() as u16).to_be_bytes());
            server_name.extend_from_slice(host.as_bytes());

            let mut list = Vec::new();
            list.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
            list.extend_from_slice(&server_name);

            self.extensions
                .extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            self.extensions
                .extend_from_slice(&(list.len() as u16).to_be_bytes());
            self.extensions.extend_from_slice(&list);
            self
        }

        fn build(mut self) -> Vec<u8> {
            self.body
                .extend_from_slice(&(self.extensions.len() as u16).to_be_bytes());
            self.body.extend_from_slice(&self.extensions);

            let mut handshake = Vec::new();
            handshake.push(HANDSHAKE_TYPE_CLIENT_HELLO);
            let len = self.body.len() as u32;
            handshake.extend_from_slice(&len.to_be_bytes()[1..]);
            handshake.extend_from_slice(&self.body);

            let mut record = Vec::new();
            record.push(CONTENT_TYPE_HANDSHAKE);
            record.extend_from_slice(&[0x03, 0x01]); // record version
            record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
            record.extend_from_slice(&handshake);
            record
        }
    }

    #[test]
    fn extracts_sni_from_well_formed_client_hello() {
        let record = ClientHelloBuilder::new().with_sni("argocd.local").build();
        assert_eq!(extract_sni(&record).unwrap(), "argocd.local");
    }

    #[test]
    fn rejects_non_tls_first_byte() {
        let mut record = ClientHelloBuilder::new().with_sni("x").build();
        record[0] = 0x17;
        assert_eq!(extract_sni(&record), Err(SniError::NotTlsHandshake));
    }

    #[test]
    fn missing_sni_extension_is_not_found() {
        let record = ClientHelloBuilder::new().build();
        assert_eq!(extract_sni(&record), Err(SniError::NotFound));
    }

    #[test]
    fn truncated_record_is_malformed() {
        let record = vec![0x16, 0x03, 0x01, 0x00];
        assert_eq!(extract_sni(&record), Err(SniError::Malformed));
    }

    #[test]
    fn fragment_length_larger_than_buffer_is_malformed() {
        let mut record = ClientHelloBuilder::new().with_sni("x").build();
        record[3] = 0xff;
        record[4] = 0xff;
        assert_eq!(extract_sni(&record), Err(SniError::Malformed));
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let record = ClientHelloBuilder::new().with_sni("repeat.local").build();
        assert_eq!(extract_sni(&record), extract_sni(&record));
    }

    #[test]
    fn empty_buffer_is_malformed() {
        assert_eq!(extract_sni(&[]), Err(SniError::Malformed));
    }
}
