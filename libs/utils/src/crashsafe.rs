use std::{borrow::Cow, io};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(
    original_path: impl AsRef<Utf8Path>,
    suffix: &str,
) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => Cow::Owned(format!("{extension}.{suffix}")),
        None => Cow::Borrowed(suffix),
    };
    original_path.as_ref().with_extension(new_extension)
}

/// Does the file name end with the given temporary suffix.
pub fn is_temporary_with_suffix(path: &Utf8Path, suffix: &str) -> bool {
    match path.file_name() {
        Some(name) => name.ends_with(&format!(".{suffix}")),
        None => false,
    }
}

pub async fn fsync_async(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    tokio::fs::File::open(path.as_ref()).await?.sync_all().await
}

/// Writes `content` to `final_path` so that after a crash the file either holds the new
/// content in full or does not change.
///
/// The content goes to a sibling file with `tmp_suffix` appended to its extension, which is
/// fsynced and renamed over `final_path`, followed by an fsync of the parent directory.
pub async fn overwrite(
    final_path: &Utf8Path,
    tmp_suffix: &str,
    content: &[u8],
) -> io::Result<()> {
    let tmp_path = path_with_suffix_extension(final_path, tmp_suffix);
    let parent = final_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {final_path} has no parent"),
        )
    })?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .await?;
    let res = async {
        file.write_all(content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, final_path).await?;
        fsync_async(parent).await
    }
    .await;

    if res.is_err() {
        // leave nothing behind which could be mistaken for a complete file
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    res
}

/// Like [`std::fs::create_dir_all`], except every directory that had to be created
/// gets fsynced along with its parent.
pub async fn create_dir_all(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    let mut path = path.as_ref();
    let mut dirs_to_create = Vec::new();

    loop {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("non-directory found in path: {path}"),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) => path = parent,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("can't find parent of path '{path}'"),
                ))
            }
        }
    }

    for &dir in dirs_to_create.iter().rev() {
        match tokio::fs::create_dir(dir).await {
            Ok(()) => {}
            // lost a race with a concurrent creator
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }

    for &dir in dirs_to_create.iter() {
        fsync_async(dir).await?;
    }

    if !dirs_to_create.is_empty() {
        fsync_async(path).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_with_suffix_extension() {
        let p = Utf8PathBuf::from("/foo/bar");
        assert_eq!(path_with_suffix_extension(&p, "temp"), "/foo/bar.temp");
        let p = Utf8PathBuf::from("/foo/bar.baz");
        assert_eq!(
            path_with_suffix_extension(&p, "temp_download"),
            "/foo/bar.baz.temp_download"
        );
    }

    #[test]
    fn test_is_temporary_with_suffix() {
        assert!(is_temporary_with_suffix(
            Utf8Path::new("/a/b.temp_download"),
            "temp_download"
        ));
        assert!(!is_temporary_with_suffix(
            Utf8Path::new("/a/b__0000000000000010"),
            "temp_download"
        ));
    }

    #[tokio::test]
    async fn overwrite_replaces_content_and_cleans_temp() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("file");

        overwrite(&target, "___temp", b"first").await.unwrap();
        overwrite(&target, "___temp", b"second").await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"second");
        let tmp = path_with_suffix_extension(&target, "___temp");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn create_dir_all_is_idempotent() {
        let dir = camino_tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("c");

        create_dir_all(&nested).await.unwrap();
        create_dir_all(&nested).await.unwrap();
        assert!(nested.is_dir());

        let file = dir.path().join("f");
        tokio::fs::write(&file, b"x").await.unwrap();
        create_dir_all(file.join("sub")).await.unwrap_err();
    }
}
