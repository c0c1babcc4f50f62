use std::{fs, io::Write as _, path::Path};

/// Atomically replace `path` with `contents`: sibling temporary, fsync the
/// file, rename over the destination, fsync the parent directory. This is the
/// minimum needed to survive power loss across the rename boundary.
pub(crate) fn replace_file(
    path: &Path,
    contents: &[u8],
    tmp_prefix: &str,
) -> std::io::Result<()> {
    let directory = parent_dir(path);
    fs::create_dir_all(directory)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(tmp_prefix)
        .suffix(".tmp")
        .tempfile_in(directory)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    fs::File::open(directory)?.sync_all()?;
    Ok(())
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if parent != Path::new("") => parent,
        _ => Path::new("."),
    }
}
