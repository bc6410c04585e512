#![no_main]

use libfuzzer_sys::fuzz_target;
use metricmerge_core::wrangle::parse_count;

fuzz_target!(|data: &str| {
    if let Some(n) = parse_count(data) {
        assert!(n >= 0);
        // Every count is a digit run of the input with dots removed.
        let stripped: String = data.chars().filter(|c| *c != '.').collect();
        assert!(stripped.contains(&n.to_string()));
    }
});
