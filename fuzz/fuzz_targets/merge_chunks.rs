#![no_main]

use libfuzzer_sys::fuzz_target;
use metricmerge_core::config::MergeConfig;
use metricmerge_core::{MergeError, process_csv_file};

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let input = dir.path().join("in.csv");
    let output = dir.path().join("out.csv");
    let mut body = b"post_id;post_extracted_datetime;post_likes\n".to_vec();
    body.extend_from_slice(data);
    if std::fs::write(&input, &body).is_err() {
        return;
    }

    let config = MergeConfig {
        chunk_size: 4,
        ..MergeConfig::default()
    };
    match process_csv_file(&input, &output, &config) {
        Ok(first) => {
            // Re-merging the same input never appends anything.
            let second = process_csv_file(&input, &output, &config).expect("second run");
            if first.rows_written > 0 {
                assert_eq!(second.rows_written, 0, "rerun appended rows");
            }
        }
        Err(MergeError::Io { .. } | MergeError::Lock(_)) => {}
        Err(err) => panic!("unexpected error on arbitrary input: {err}"),
    }
});
