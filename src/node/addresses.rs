/// Picks the address of `key_name` out of an `addr list` listing.
///
/// Each row is whitespace separated as `index name address`; rows with fewer
/// than three fields (headers, blank lines) are skipped.
pub fn parse_address_list<'a>(listing: &'a str, key_name: &str) -> Option<&'a str> {
    listing
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|fields| fields.len() >= 3)
        .find(|fields| fields[1] == key_name)
        .map(|fields| fields[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
 Index  Label      Address
     0  validator  penumbrav2t1qqqq
     1  relayer    penumbrav2t1rrrr

";

    #[test]
    fn finds_matching_label() {
        assert_eq!(
            parse_address_list(LISTING, "relayer"),
            Some("penumbrav2t1rrrr")
        );
    }

    #[test]
    fn header_row_is_parsed_like_any_row() {
        // three fields, so only the label column keeps it from matching
        assert_eq!(parse_address_list(LISTING, "Label"), Some("Address"));
        assert_eq!(parse_address_list(LISTING, "Index"), None);
    }

    #[test]
    fn short_rows_are_skipped() {
        let listing = "0 validator\nvalidator\n2 validator penumbrav2t1vvvv";
        assert_eq!(
            parse_address_list(listing, "validator"),
            Some("penumbrav2t1vvvv")
        );
    }

    #[test]
    fn unknown_name_is_none() {
        assert_eq!(parse_address_list(LISTING, "faucet"), None);
        assert_eq!(parse_address_list("", "faucet"), None);
    }
}
