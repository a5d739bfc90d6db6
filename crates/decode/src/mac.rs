/// Canonicalise a MAC address: hex digits only, uppercase, exactly 12 of them.
///
/// Separators of any kind are dropped, so `aa:bb:cc:dd:ee:ff`,
/// `Aa-Bb-Cc-Dd-Ee-Ff` and `AABBCCDDEEFF` all map to the same key.
pub fn normalize_mac(input: &str) -> Option<String> {
    let mac: String = input
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    (mac.len() == 12).then_some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_and_case_collapse_to_one_form() {
        for input in ["aa:bb:cc:dd:ee:ff", "AABBCCDDEEFF", "Aa-Bb-Cc-Dd-Ee-Ff"] {
            assert_eq!(normalize_mac(input).as_deref(), Some("AABBCCDDEEFF"), "{input}");
        }
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert_eq!(
            normalize_mac("  a1 b2 c3 d4 e5 f6\n").as_deref(),
            Some("A1B2C3D4E5F6")
        );
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(normalize_mac("AA:BB:CC:DD:EE"), None);
        assert_eq!(normalize_mac("AA:BB:CC:DD:EE:FF:00"), None);
        assert_eq!(normalize_mac(""), None);
    }

    #[test]
    fn non_hex_letters_do_not_count() {
        // 'G'..'Z' are dropped, leaving only ten hex digits
        assert_eq!(normalize_mac("GG:AA:BB:CC:DD:EE"), None);
    }
}
