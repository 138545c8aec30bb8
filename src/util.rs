use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];

    loop {
        let count = file
            .read(&mut buf)
            .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Writes `path` through a hidden sibling file that is renamed into place once
/// `fill` succeeds, so readers never observe a partially written file.
pub fn write_atomically<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }

    let staging_path = staging_path_for(path)?;
    let result = (|| {
        let file = File::create(&staging_path)
            .with_context(|| format!("failed to create {}", staging_path.display()))?;
        let mut writer = BufWriter::new(file);
        fill(&mut writer)?;
        let file = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("failed to flush {}", staging_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", staging_path.display()))?;
        fs::rename(&staging_path, path).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                staging_path.display(),
                path.display()
            )
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&staging_path);
    }
    result
}

pub fn staging_path_for(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid output file name: {}", path.display()))?;
    Ok(path.with_file_name(format!(".{file_name}.partial")))
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;

    write_atomically(path, |writer| {
        writer
            .write_all(&data)
            .with_context(|| format!("failed to write json file: {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to finalize json file: {}", path.display()))?;
        Ok(())
    })
}
