use std::fs::File;
use std::io::Read;

use camino::Utf8Path;
use md5::{Digest, Md5};

use crate::error::KiraError;

const CHUNK_SIZE: usize = 1 << 20;

/// Lowercase hex MD5 of a file, read in 1 MiB chunks.
pub fn file_md5(path: &Utf8Path) -> Result<String, KiraError> {
    let digest_error = || KiraError::Digest(path.as_std_path().to_path_buf());
    let mut file = File::open(path.as_std_path()).map_err(|err| {
        tracing::warn!(file = %path, %err, "unable to open file for digest");
        digest_error()
    })?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            tracing::warn!(file = %path, %err, "read failed while computing digest");
            digest_error()
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn bytes_md5(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}
