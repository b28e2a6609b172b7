use serde::Deserialize;

use std::{env, fs};

use super::*;

#[derive(Debug, Deserialize, PartialEq)]
struct Profile {
    name: String,
    size: Option<usize>,
}

#[test]
fn test_load_toml() {
    let dir = env::temp_dir().join("rrbt-test-load-toml");
    fs::create_dir_all(&dir).unwrap();

    let loc = dir.join("profile.toml");
    fs::write(&loc, "name = \"tree\"\nsize = 10\n").unwrap();
    let profile: Profile = load_toml(&loc).unwrap();
    assert_eq!(
        profile,
        Profile { name: "tree".to_string(), size: Some(10) }
    );

    fs::write(&loc, "name = 10").unwrap();
    match load_toml::<_, Profile>(&loc) {
        Err(crate::Error::InvalidFile(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    match load_toml::<_, Profile>(dir.join("missing.toml")) {
        Err(crate::Error::IOError(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
}
