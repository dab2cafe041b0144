//! Map persistence.
//!
//! A map is stored as a small envelope around the bincode-encoded [`Atlas`]:
//!
//! ```text
//! "VSLM" | format version (u32 LE) | bincode(Atlas)
//! ```
//!
//! The bytes are opaque to callers; where they are stored is up to them.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::atlas::Atlas;
use crate::error::{Result, SlamError};

const MAGIC: &[u8; 4] = b"VSLM";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

/// Serialize a map into its persisted byte form.
pub fn export_map(atlas: &Atlas) -> Result<Vec<u8>> {
    let body = bincode::serialize(atlas)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Rebuild a map from bytes produced by [`export_map`].
///
/// Fails with `MapFormat` on a foreign or truncated stream, an unknown
/// version, or a map whose parts disagree (e.g. descriptor lengths).
pub fn import_map(bytes: &[u8]) -> Result<Atlas> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(SlamError::MapFormat("not a map file".into()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..HEADER_LEN]);
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(SlamError::MapFormat(format!(
            "unsupported format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let atlas: Atlas = bincode::deserialize(&bytes[HEADER_LEN..])?;
    atlas.check_integrity()?;
    Ok(atlas)
}

pub fn export_map_file(atlas: &Atlas, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let bytes = export_map(atlas)?;
    fs::write(path, &bytes)?;
    info!(
        "[Persistence] wrote {} ({} keyframes, {} landmarks, {} bytes)",
        path.display(),
        atlas.num_keyframes(),
        atlas.map().num_map_points(),
        bytes.len()
    );
    Ok(())
}

pub fn import_map_file(path: impl AsRef<Path>) -> Result<Atlas> {
    let path = path.as_ref();
    let atlas = import_map(&fs::read(path)?)?;
    info!(
        "[Persistence] loaded {} ({} keyframes, {} landmarks)",
        path.display(),
        atlas.num_keyframes(),
        atlas.map().num_map_points()
    );
    Ok(atlas)
}
