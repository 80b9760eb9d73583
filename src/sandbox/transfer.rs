// Tar archives for copying host files into a container and back out.

use super::error::{Result, SandboxError};
use std::path::{Component, Path};

/// Archive `source` (file or directory) under the single top-level entry `name`.
pub fn pack_path(source: &Path, name: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    if source.is_dir() {
        builder.append_dir_all(name, source)?;
    } else {
        builder.append_path_with_name(source, name)?;
    }
    Ok(builder.into_inner()?)
}

/// Archive `content` as one regular file `name` with `mode`.
pub fn pack_file(name: &str, content: &[u8], mode: u32) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, content)?;
    Ok(builder.into_inner()?)
}

/// Unpack `archive` below `dest`, refusing entries that would land outside it.
pub fn unpack_into(archive: &[u8], dest: &Path) -> Result<Vec<String>> {
    std::fs::create_dir_all(dest)?;
    let mut unpacked = Vec::new();
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(SandboxError::Configuration(format!(
                "archive entry {} escapes {}",
                path.display(),
                dest.display()
            )));
        }
        if entry.unpack_in(dest)? {
            unpacked.push(path.to_string_lossy().into_owned());
        }
    }
    Ok(unpacked)
}

/// Unix mode for a tool file from its `rwx` digit (4 read, 2 write, 1 execute).
pub fn mode_from_permissions(permissions: u8) -> u32 {
    let mut mode = 0;
    if permissions & 4 != 0 {
        mode |= 0o444;
    }
    if permissions & 2 != 0 {
        mode |= 0o200;
    }
    if permissions & 1 != 0 {
        mode |= 0o111;
    }
    mode
}
