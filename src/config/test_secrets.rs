use crate::config::read_env_or_file;
use std::env;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_read_env_or_file() {
    // Direct env var wins
    env::set_var("GRIDBNB_TEST_SECRET", "direct_value");
    assert_eq!(
        read_env_or_file("GRIDBNB_TEST_SECRET").unwrap(),
        "direct_value"
    );
    env::remove_var("GRIDBNB_TEST_SECRET");

    // *_FILE indirection, surrounding whitespace trimmed
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "  file_value  ").unwrap();
    let path = file.path().to_str().unwrap();

    env::set_var("GRIDBNB_TEST_SECRET_FILE", path);
    assert_eq!(
        read_env_or_file("GRIDBNB_TEST_SECRET").unwrap(),
        "file_value"
    );
    env::remove_var("GRIDBNB_TEST_SECRET_FILE");

    assert!(read_env_or_file("GRIDBNB_TEST_SECRET").is_err());
}
