use super::util::{hostname, prepend_hostname};
use std::path::PathBuf;

#[test]
pub fn prepend_hostname_to_file_name() {
    let host = hostname().unwrap();
    let mut path = PathBuf::from("/var/lib/drover/gpu01.db");

    prepend_hostname(&mut path).unwrap();

    assert_eq!(
        path,
        PathBuf::from(format!("/var/lib/drover/{host}_gpu01.db"))
    );
}

#[test]
pub fn prepend_hostname_keeps_directory() {
    let host = hostname().unwrap();
    let mut path = PathBuf::from("records.db");

    prepend_hostname(&mut path).unwrap();

    assert_eq!(path, PathBuf::from(format!("{host}_records.db")));
    assert!(!host.is_empty());
}
