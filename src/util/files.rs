use serde::de::DeserializeOwned;

use std::{fs, path};

use crate::Result;

/// Load toml file and parse it into type `T`.
pub fn load_toml<P, T>(loc: P) -> Result<T>
where
    P: AsRef<path::Path>,
    T: DeserializeOwned,
{
    let loc: &path::Path = loc.as_ref();
    let text = err_at!(IOError, fs::read(loc), "reading {:?}", loc)?;
    let text = err_at!(InvalidFile, std::str::from_utf8(&text), "{:?}", loc)?;
    err_at!(InvalidFile, toml::from_str(text), "parsing {:?}", loc)
}

#[cfg(test)]
#[path = "files_test.rs"]
mod files_test;
