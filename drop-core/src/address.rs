//! # Address Normalization
//!
//! Turns raw wallet strings (pasted lists, CSV exports) into canonical EVM
//! addresses. A batch never fails because of one bad entry: invalid inputs
//! are partitioned out and reported back.

use crate::error::AddressError;
use ethers::types::Address;
use ethers::utils::to_checksum;
use std::collections::BTreeSet;

/// Result of normalizing a batch of raw address strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedAddresses {
    pub valid: BTreeSet<Address>,
    pub invalid: Vec<String>,
}

impl NormalizedAddresses {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Parse one address.
///
/// Accepts an optional `0x` prefix and exactly 40 hex digits. Single-case
/// input is taken as-is; mixed-case input must carry a valid EIP-55 checksum.
pub fn normalize(raw: &str) -> Result<Address, AddressError> {
    let trimmed = raw.trim();
    let malformed = |reason: &str| AddressError::Malformed {
        input: raw.to_string(),
        reason: reason.to_string(),
    };

    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.len() != 40 {
        return Err(malformed("expected 40 hex digits"));
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(malformed("contains non-hex characters"));
    }

    let bytes = hex::decode(digits).map_err(|e| malformed(&e.to_string()))?;
    let address = Address::from_slice(&bytes);

    let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        let expected = to_checksum(&address, None);
        if expected[2..] != *digits {
            return Err(malformed("checksum mismatch"));
        }
    }

    Ok(address)
}

/// Normalize a batch, deduplicating valid entries and collecting bad ones.
pub fn normalize_all<I, S>(raw_list: I) -> NormalizedAddresses
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut result = NormalizedAddresses::default();
    for raw in raw_list {
        let raw = raw.as_ref();
        match normalize(raw) {
            Ok(address) => {
                result.valid.insert(address);
            }
            Err(_) => result.invalid.push(raw.trim().to_string()),
        }
    }
    result
}

/// Split pasted text or a CSV export into candidate address cells.
///
/// Separators are newlines, commas, semicolons and whitespace. Empty cells and
/// an `address` header cell are skipped.
pub fn parse_address_list(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(|cell| cell.trim().trim_matches('"'))
        .filter(|cell| !cell.is_empty() && !cell.eq_ignore_ascii_case("address"))
        .map(str::to_string)
        .collect()
}

/// Canonical EIP-55 display form.
pub fn display(address: &Address) -> String {
    to_checksum(address, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUMMED: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn test_normalize_forms_agree() {
        let a = normalize(CHECKSUMMED).unwrap();
        let b = normalize(&CHECKSUMMED.to_lowercase()).unwrap();
        let c = normalize(&CHECKSUMMED[2..].to_uppercase()).unwrap();
        let d = normalize(&format!("  {}\n", CHECKSUMMED)).unwrap();

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize(&CHECKSUMMED.to_lowercase()).unwrap();
        let twice = normalize(&display(&once)).unwrap();
        assert_eq!(once, twice);
        assert_eq!(display(&once), CHECKSUMMED);
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let broken = CHECKSUMMED.replace("aAeb", "AAeb");
        assert!(matches!(
            normalize(&broken),
            Err(AddressError::Malformed { .. })
        ));
    }

    #[test]
    fn test_structural_errors() {
        assert!(normalize("0x1234").is_err());
        assert!(normalize("").is_err());
        assert!(normalize("0xZZZeb6053F3E94C9b9A09f33669435E7Ef1BeAed").is_err());
    }

    #[test]
    fn test_normalize_all_partitions() {
        let raw = vec![
            CHECKSUMMED.to_string(),
            CHECKSUMMED.to_lowercase(),
            "not-an-address".to_string(),
            "0x0000000000000000000000000000000000000001".to_string(),
        ];
        let result = normalize_all(&raw);

        assert_eq!(result.valid.len(), 2);
        assert_eq!(result.invalid, vec!["not-an-address".to_string()]);
        assert!(!result.is_clean());
    }

    #[test]
    fn test_parse_address_list() {
        let text = "address\n0xabc, 0xdef;\"0x123\"\n\n  0x456  ";
        assert_eq!(
            parse_address_list(text),
            vec!["0xabc", "0xdef", "0x123", "0x456"]
        );
    }
}
