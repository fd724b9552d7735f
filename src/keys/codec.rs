//! Public-key codec: the only place that interprets raw key bytes.
//!
//! Everything downstream (the SSH server, the authorized-keys manager, the
//! forge) treats keys as opaque canonical base-64 strings once this module
//! has validated them, which keeps the fingerprint → bytes mapping bijective
//! with the canonical form and avoids re-parsing on every connection.
//!
//! Two entry points: [`parse_blob`] decodes a single base-64 key body, and
//! [`SupportedKeyTypes::parse_user_input`] scans arbitrary pasted text
//! (OpenSSH single-line or SSH2 armored) for the first decodable body and
//! validates it against the supported-type table.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Key-type identifiers (canonical on-wire names)
// ---------------------------------------------------------------------------

pub const KEY_ALGO_RSA: &str = "ssh-rsa";
pub const KEY_ALGO_DSA: &str = "ssh-dss";
pub const KEY_ALGO_ECDSA_256: &str = "ecdsa-sha2-nistp256";
pub const KEY_ALGO_ECDSA_384: &str = "ecdsa-sha2-nistp384";
pub const KEY_ALGO_ECDSA_521: &str = "ecdsa-sha2-nistp521";
pub const KEY_ALGO_ED25519: &str = "ssh-ed25519";

// ---------------------------------------------------------------------------
// Parsed key
// ---------------------------------------------------------------------------

/// A successfully decoded public key body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    /// Whitespace-free standard base-64 of the raw key bytes.  Round-trip
    /// stable: re-parsing `canonical` yields `canonical` again.
    pub canonical: String,
    /// Lowercase colon-free hex MD5 of the raw key bytes.
    pub fingerprint: String,
    /// First wire field, e.g. `ssh-rsa`.
    pub key_type: String,
    /// Effective key size in bits, computed per type.
    pub size_bits: usize,
}

/// Compute the canonical fingerprint of raw key bytes: lowercase hex MD5,
/// 32 characters, no separators.
pub fn fingerprint(raw: &[u8]) -> String {
    hex::encode(Md5::digest(raw))
}

/// Colon-separated rendering of a hex fingerprint, for log output only.
pub fn colon_fingerprint(fp: &str) -> String {
    fp.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

fn is_base64_or_newline(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'+' | b'=' | b'/' | b'\r' | b'\n')
}

/// Decode the leading base-64 portion of `input`, ignoring anything after
/// the first padded quantum (or after the last complete quantum when there
/// is no padding).  This tolerates trailing rubbish and lets multi-line
/// SSH2 bodies decode once the line breaks have been stripped.
fn decode_prefix(input: &[u8]) -> Option<Vec<u8>> {
    let end = match input.iter().position(|&b| b == b'=') {
        Some(i) => (i / 4 + 1) * 4,
        None => input.len() / 4 * 4,
    };
    let end = end.min(input.len());
    if end == 0 {
        return None;
    }
    BASE64.decode(&input[..end]).ok()
}

/// Decode a single base-64 key body into its canonical fields.
///
/// With `already_clean` set, `content` is expected to be exactly one base-64
/// body (as stored by the forge).  Otherwise the input is first truncated at
/// the first byte outside `[0-9A-Za-z+=/\r\n]`, then CR/LF are dropped so a
/// body wrapped across lines concatenates.
///
/// Returns `None` when nothing decodes, when the length-prefixed field
/// structure is inconsistent, or when the key type is unknown or has the
/// wrong field count.
pub fn parse_blob(content: &[u8], already_clean: bool) -> Option<ParsedKey> {
    let mut content = content;
    if !already_clean {
        if let Some(end) = content.iter().position(|&b| !is_base64_or_newline(b)) {
            content = &content[..end];
        }
    }

    let filtered: Vec<u8> = content
        .iter()
        .copied()
        .filter(|&b| b != b'\r' && b != b'\n')
        .collect();

    let raw = decode_prefix(&filtered)?;
    if raw.is_empty() {
        return None;
    }

    let canonical = BASE64.encode(&raw);
    let fingerprint = fingerprint(&raw);

    // The decoded blob is a sequence of 4-byte big-endian length-prefixed
    // fields; the first field is the key-type string.
    let mut rest = raw.as_slice();
    let mut fields: Vec<&[u8]> = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return None;
        }
        fields.push(&rest[..len]);
        rest = &rest[len..];
    }

    if fields.len() < 2 {
        return None;
    }

    let key_type = std::str::from_utf8(fields[0]).ok()?.to_string();
    let size_bits = match key_type.as_str() {
        // Field 2 is the modulus with a leading zero pad byte.
        KEY_ALGO_RSA => {
            if fields.len() != 3 {
                return None;
            }
            fields[2].len().saturating_sub(1) * 8
        }
        // Field 1 is the prime p, also zero-padded.
        KEY_ALGO_DSA => {
            if fields.len() != 5 {
                return None;
            }
            fields[1].len().saturating_sub(1) * 8
        }
        KEY_ALGO_ED25519 => {
            if fields.len() != 2 {
                return None;
            }
            fields[1].len() * 8
        }
        KEY_ALGO_ECDSA_256 => {
            if fields.len() != 3 {
                return None;
            }
            256
        }
        KEY_ALGO_ECDSA_384 => {
            if fields.len() != 3 {
                return None;
            }
            384
        }
        KEY_ALGO_ECDSA_521 => {
            if fields.len() != 3 {
                return None;
            }
            521
        }
        _ => return None,
    };

    Some(ParsedKey {
        canonical,
        fingerprint,
        key_type,
        size_bits,
    })
}

// ---------------------------------------------------------------------------
// Supported-type table
// ---------------------------------------------------------------------------

/// Map from key-type identifier to the minimum accepted size in bits.
///
/// Built once before the server starts listening and read-only afterwards.
/// `ssh-ed25519` is only present when proxy mode is enabled and the external
/// `ssh-keygen` probe confirmed support.
#[derive(Debug, Clone)]
pub struct SupportedKeyTypes {
    minimums: HashMap<&'static str, usize>,
}

impl SupportedKeyTypes {
    /// The always-supported types.
    pub fn builtin() -> Self {
        let minimums = HashMap::from([
            (KEY_ALGO_DSA, 1024),
            (KEY_ALGO_RSA, 2048),
            (KEY_ALGO_ECDSA_256, 256),
            (KEY_ALGO_ECDSA_384, 384),
            (KEY_ALGO_ECDSA_521, 521),
        ]);
        Self { minimums }
    }

    pub fn insert(&mut self, key_type: &'static str, minimum_bits: usize) {
        self.minimums.insert(key_type, minimum_bits);
    }

    pub fn minimum_bits(&self, key_type: &str) -> Option<usize> {
        self.minimums.get(key_type).copied()
    }

    /// Scan arbitrary user-pasted text for a decodable key body.
    ///
    /// Tries [`parse_blob`] at the start of the text and after every
    /// whitespace byte.  The first successful parse is final: an unknown
    /// type or an undersized key fails immediately rather than continuing
    /// the scan.  Accepts the SSH2 armored form, whose header and footer
    /// lines never decode and whose body lines concatenate through the
    /// intra-token cleaner.
    pub fn parse_user_input(&self, content: &str) -> Result<(String, String), Error> {
        let bytes = content.as_bytes();
        let mut start = 0;
        loop {
            let tail = &bytes[start..];
            if let Some(key) = parse_blob(tail, false) {
                let minimum = self
                    .minimum_bits(&key.key_type)
                    .ok_or(Error::KeyTypeNotSupported)?;
                if key.size_bits < minimum {
                    return Err(Error::KeyTooSmall);
                }
                return Ok((key.canonical, key.fingerprint));
            }
            match tail
                .iter()
                .position(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0c'))
            {
                Some(i) => start += i + 1,
                None => return Err(Error::NoKey),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct KeyData {
        body: &'static str,
        key_type: &'static str,
        size_bits: usize,
        fingerprint: &'static str,
    }

    const TEST_KEYS: &[KeyData] = &[
        KeyData {
            body: "AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBKDMeKhrQa+GPPOIksafnmlxcH401iCTN6UEPZayC0gnQM3cIuEX2y58EwyVHITfgbDndM4A/lZDLTQnxekiHmk=",
            key_type: KEY_ALGO_ECDSA_256,
            size_bits: 256,
            fingerprint: "25762f3b08a514b9addfb2f538f04ab3",
        },
        KeyData {
            body: "AAAAE2VjZHNhLXNoYTItbmlzdHAzODQAAAAIbmlzdHAzODQAAABhBD66ur1JKLaUZZ1Ug/fbXbMlwd8YOwxLfcvrxAg+L73kJPkiPzXE0zkYycBBKRF0mH1P4OOzjzPXx4KNtKFrmR0Y5kFWPcbALcveNG/u3V1W5lql1c1r3ehL+6OOjQEq0w==",
            key_type: KEY_ALGO_ECDSA_384,
            size_bits: 384,
            fingerprint: "a5c7d72891386264ceba65198c151c91",
        },
        KeyData {
            body: "AAAAE2VjZHNhLXNoYTItbmlzdHA1MjEAAAAIbmlzdHA1MjEAAACFBAErzKhOVCufSiP2xlQmIzvRHXD6t4JTl4JS0XPz9TInkcZqRi0Juz64FAzcurkC/8d0qGdvAQXfZ+wOPSYrXfEeNwCwQGlNYImpaTcqg3RQxKQPdZKAux0yq0ptkG8OULfieRATe648kiN5ZWSb3WGneRA3FkbFR/sxTosCD8XLMJQVBg==",
            key_type: KEY_ALGO_ECDSA_521,
            size_bits: 521,
            fingerprint: "0b2d537bb89102ee96996feaa3d40ebd",
        },
        KeyData {
            body: "AAAAB3NzaC1kc3MAAACBAIj1YvMaQrHDEnDX7f7mBSctXyFuVXPEU04HXDUASi0oLmiQe1iTHf3BXX6pdAa3Mc8bZ30HwQ5kjyxSA8LascD/VAoznv1FolDee4wjGex4cGfvfn56hHG/uf4HQS3AzxnT+hBSDFkWm/AY+f8PQArhlGQfhpzgrzVxbtA2pFbHAAAAFQC+I3TjWrpmZv3zMJ+ZNuyZA68HHQAAAIAs3AWnA73BXh3BdgPRxrWzlOm98Kah7XgTKFUUO27KGWIgNYY1tP/NZRSA1yBwu1l7O3AY3knhyuNrEVbyReA+qxjbUrHQEOVxb3NFIsoSdKm7HrIjSUc3KvAT2dKXCx1dOyircuEnyhmkph+kgcYtaXwcvMysSk812sKcbkDulgAAAIAXa0LcU1LpAOejqrqdkb7COshigYQS8gxrePhPx3skt9k4nMJ3/dTOsL92LpEUIdixoeXvv8fjRrVhEu+eoJ9QSgRwcIE7WEIjmDRLV0VDJE4WCfOR3pmGHi18WC9CKTopowpV3SGtUGuzHZBUs4EbYWwxvZnOviddRR89igEAKg==",
            key_type: KEY_ALGO_DSA,
            size_bits: 1024,
            fingerprint: "49d343d538ca3a734b9f30069a44452e",
        },
        KeyData {
            body: "AAAAC3NzaC1lZDI1NTE5AAAAIOw6e0L1FN9qMPrF1K6NiAZQlezvGwFsfPFVjUH/sdx0",
            key_type: KEY_ALGO_ED25519,
            size_bits: 256,
            fingerprint: "49a5ef89c1ca23515fedaad4188125ea",
        },
        KeyData {
            body: "AAAAB3NzaC1yc2EAAAADAQABAAABAQDTbuP29xhh2XpqNC5BsiOlf0njyiBYU0zm4CyLpVu3PktnCaCk/zztIIIQJNlg7xKsnEyBmhG+vy1IeD7raoBG55OHZsKdEwqEr6O+dmVEy/cghD0/X1AKLF0q/1offo3VgDyfHkINgnheUR8a7csRJLF3H0mdeWFFlIp0hO5E66NXvcH8xAeCbPfRqbe5v6zcHqVUASwvWFHeLIKCVtRJjsbklLOtleTeftFp7ML9CgpxIuYvUUOXd5Zvi7ZYoU/Ey5dYHnqQoRKqk9XcFn03+NiH2O7udtDW7F9ylPwueveIWAZ7RgL0DufJ0H0Iu/4N3d+6dCIBKNwKZGQj8u4B",
            key_type: KEY_ALGO_RSA,
            size_bits: 2048,
            fingerprint: "bec0957f854e8153e28b80840f2efec5",
        },
    ];

    #[test]
    fn parse_clean_bodies() {
        for data in TEST_KEYS {
            let parsed = parse_blob(data.body.as_bytes(), true)
                .unwrap_or_else(|| panic!("key ({}) not recognized", data.key_type));
            assert_eq!(parsed.canonical, data.body, "key ({})", data.key_type);
            assert_eq!(parsed.fingerprint, data.fingerprint, "key ({})", data.key_type);
            assert_eq!(parsed.key_type, data.key_type);
            assert_eq!(parsed.size_bits, data.size_bits, "key ({})", data.key_type);
        }
    }

    #[test]
    fn fingerprint_matches_md5_of_decoded_body() {
        for data in TEST_KEYS {
            let raw = BASE64.decode(data.body).unwrap();
            let parsed = parse_blob(data.body.as_bytes(), true).unwrap();
            assert_eq!(parsed.fingerprint, fingerprint(&raw));
        }
    }

    #[test]
    fn prepended_fake_field_is_rejected() {
        for data in TEST_KEYS {
            let doctored = format!("AAAAAQAA{}", data.body);
            assert!(
                parse_blob(doctored.as_bytes(), true).is_none(),
                "key ({}) should not parse with a fake packet prepended",
                data.key_type
            );
        }
    }

    #[test]
    fn appended_rubbish_is_tolerated_when_cleaning() {
        for data in TEST_KEYS {
            let noisy = format!("{}\n-----", data.body);
            let parsed = parse_blob(noisy.as_bytes(), false)
                .unwrap_or_else(|| panic!("key ({}) should parse with rubbish appended", data.key_type));
            assert_eq!(parsed.canonical, data.body, "key ({})", data.key_type);
        }
    }

    #[test]
    fn user_input_accepts_ssh2_armor() {
        let armored = "---- BEGIN SSH2 PUBLIC KEY ----\n\
Comment: \"1024-bit RSA, converted from OpenSSH by me@example.com\"\n\
x-command: /home/me/bin/lock-in-guest.sh\n\
AAAAB3NzaC1yc2EAAAADAQABAAABAQDTbuP29xhh2XpqNC5BsiOlf0njyiBYU0zm4CyL\n\
pVu3PktnCaCk/zztIIIQJNlg7xKsnEyBmhG+vy1IeD7raoBG55OHZsKdEwqEr6O+dmVE\n\
y/cghD0/X1AKLF0q/1offo3VgDyfHkINgnheUR8a7csRJLF3H0mdeWFFlIp0hO5E66NX\n\
vcH8xAeCbPfRqbe5v6zcHqVUASwvWFHeLIKCVtRJjsbklLOtleTeftFp7ML9CgpxIuYv\n\
UUOXd5Zvi7ZYoU/Ey5dYHnqQoRKqk9XcFn03+NiH2O7udtDW7F9ylPwueveIWAZ7RgL0\n\
DufJ0H0Iu/4N3d+6dCIBKNwKZGQj8u4B\n\
---- END SSH2 PUBLIC KEY ----";
        let base = TEST_KEYS[5].body;

        let table = SupportedKeyTypes::builtin();
        let (canonical, fp) = table.parse_user_input(armored).expect("SSH2 key not recognized");
        assert_eq!(canonical, base);
        assert_eq!(fp, "bec0957f854e8153e28b80840f2efec5");
    }

    #[test]
    fn user_input_accepts_openssh_line() {
        let line = format!("ssh-rsa {} user@example.net", TEST_KEYS[5].body);
        let table = SupportedKeyTypes::builtin();
        let (canonical, fp) = table.parse_user_input(&line).unwrap();
        assert_eq!(canonical, TEST_KEYS[5].body);
        assert_eq!(fp, TEST_KEYS[5].fingerprint);
    }

    #[test]
    fn user_input_errors() {
        // ed25519 is absent from the builtin table.
        let unsupported = "AAAAC3NzaC1lZDI1NTE5AAAAIOw6e0L1FN9qMPrF1K6NiAZQlezvGwFsfPFVjUH/sdx0";
        // A 1024-bit RSA key, below the 2048-bit minimum.
        let too_small = "AAAAB3NzaC1yc2EAAAADAQABAAAAgQC4cB6EzRhmwGObIa1lXt/XpHwLjjBt3CxBe2GItJ1RRIDqDd15+DGKbgn4fQXl5ZfqSwignQlY7dFt4L6F5YlvyGy/NH/+KG5UZjZvMvjeI9C2W2WWjKbYimKmbCs/SvSDgyeTLg7bKXOaIR0gPl/3gdjhpFJ1s9wVSnoZoFeoIQ==";

        let table = SupportedKeyTypes::builtin();
        assert!(matches!(
            table.parse_user_input(unsupported),
            Err(Error::KeyTypeNotSupported)
        ));
        assert!(matches!(table.parse_user_input(too_small), Err(Error::KeyTooSmall)));
        assert!(matches!(table.parse_user_input(""), Err(Error::NoKey)));
    }

    #[test]
    fn ed25519_validates_once_added() {
        let key = TEST_KEYS[4].body;
        let mut table = SupportedKeyTypes::builtin();
        table.insert(KEY_ALGO_ED25519, 256);
        let (canonical, _) = table.parse_user_input(key).unwrap();
        assert_eq!(canonical, key);
    }

    #[test]
    fn malformed_field_structures_are_rejected() {
        let invalids: Vec<Vec<u8>> = vec![
            // Unknown type.
            [&[0, 0, 0, 3][..], b"ssh", &[0, 0, 0, 1], b"b"].concat(),
            // Wrong field counts per type.
            [&[0, 0, 0, 7][..], b"ssh-rsa", &[0, 0, 0, 1], b"b"].concat(),
            [&[0, 0, 0, 7][..], b"ssh-dss", &[0, 0, 0, 1], b"b"].concat(),
            [
                &[0, 0, 0, 19][..],
                b"ecdsa-sha2-nistp256",
                &[0, 0, 0, 1],
                b"b",
            ]
            .concat(),
            [
                &[0, 0, 0, 11][..],
                b"ssh-ed25519",
                &[0, 0, 0, 1],
                b"b",
                &[0, 0, 0, 1],
                b"b",
            ]
            .concat(),
            // Single field only.
            [&[0, 0, 0, 7][..], &b"ssh-rsa"[..]].concat(),
        ];

        for raw in invalids {
            let encoded = BASE64.encode(&raw);
            assert!(
                parse_blob(encoded.as_bytes(), true).is_none(),
                "{encoded} should not be accepted"
            );
        }
    }

    #[test]
    fn colon_fingerprint_renders_pairs() {
        assert_eq!(
            colon_fingerprint("bec0957f854e8153e28b80840f2efec5"),
            "be:c0:95:7f:85:4e:81:53:e2:8b:80:84:0f:2e:fe:c5"
        );
    }
}
