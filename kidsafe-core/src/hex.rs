//! Lowercase hex encoding for digests and MACs.

pub(crate) fn encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn decode(s: &str) -> Result<Vec<u8>, String> {
    if !s.is_ascii() {
        return Err("Non-ASCII hex string".to_string());
    }
    if !s.len().is_multiple_of(2) {
        return Err("Odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex at position {}: {}", i, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let original = b"\x00\x7f\xffkidsafe";
        let encoded = encode(original);
        assert_eq!(&encoded[..6], "007fff");
        assert_eq!(decode(&encoded).unwrap(), original.to_vec());
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert!(decode("abc").is_err());
        assert!(decode("zz").is_err());
        assert!(decode("éé").is_err());
    }
}
