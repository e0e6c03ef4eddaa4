use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::VersionReadError;
use crate::ports::VersionReader;

/// `VS_FIXEDFILEINFO.dwSignature`, little endian.
const FIXED_FILE_INFO_SIGNATURE: [u8; 4] = [0xBD, 0x04, 0xEF, 0xFE];
const FINGERPRINT_LEN: usize = 16;

/// Reads the embedded file version of `.exe`/`.dll` files and a content fingerprint for
/// everything else.
#[derive(Debug, Default)]
pub struct FileVersionReader;

#[async_trait]
impl VersionReader for FileVersionReader {
    async fn read_version(&self, path: &Path) -> Result<String, VersionReadError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| VersionReadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if has_version_resource(path) {
            file_version(&bytes).ok_or(VersionReadError::NoVersion)
        } else {
            Ok(content_fingerprint(&bytes))
        }
    }
}

fn has_version_resource(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe") || ext.eq_ignore_ascii_case("dll"))
}

/// Locates `VS_FIXEDFILEINFO` and formats `dwFileVersionMS`/`dwFileVersionLS` as `a.b.c.d`.
pub fn file_version(bytes: &[u8]) -> Option<String> {
    let start = bytes
        .windows(FIXED_FILE_INFO_SIGNATURE.len())
        .position(|w| w == FIXED_FILE_INFO_SIGNATURE.as_slice())?;
    // signature, struct version, file version MS, file version LS
    let info = bytes.get(start..start + 16)?;
    let dword = |offset: usize| {
        u32::from_le_bytes([info[offset], info[offset + 1], info[offset + 2], info[offset + 3]])
    };
    let (ms, ls) = (dword(8), dword(12));

    Some(format!(
        "{}.{}.{}.{}",
        ms >> 16,
        ms & 0xFFFF,
        ls >> 16,
        ls & 0xFFFF
    ))
}

pub fn content_fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
        .chars()
        .take(FINGERPRINT_LEN)
        .collect()
}
