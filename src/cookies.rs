#![forbid(unsafe_code)]

//! One-shot cookie file bootstrap.
//!
//! Some videos (age-restricted, region-locked) only resolve when the
//! subprocess presents account cookies. We accept them as an environment
//! variable and materialize them once at startup; rotation requires a
//! restart.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

pub const COOKIES_FILE: &str = "/tmp/youtube_cookies.txt";

/// Writes the cookie file from `YOUTUBE_COOKIES` and returns its path, or
/// `None` when no cookies are configured or the write failed. Either way the
/// service keeps starting; cookie-less resolution just covers fewer videos.
pub fn init(cookies: Option<&str>) -> Option<PathBuf> {
    let Some(contents) = cookies else {
        warn!("YOUTUBE_COOKIES not set; age-restricted videos may fail to resolve");
        return None;
    };

    let path = PathBuf::from(COOKIES_FILE);
    match write_cookies_file(&path, contents) {
        Ok(()) => {
            info!(path = %path.display(), "cookie file initialized");
            Some(path)
        }
        Err(err) => {
            warn!("failed to write cookie file: {err:#}");
            None
        }
    }
}

/// Cookies are credentials, so the file is created 0600.
fn write_cookies_file(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn writes_contents_with_restricted_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        write_cookies_file(&path, "# Netscape HTTP Cookie File\n").unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "# Netscape HTTP Cookie File\n"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn overwrites_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        write_cookies_file(&path, "first").unwrap();
        write_cookies_file(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn init_without_cookies_is_none() {
        assert!(init(None).is_none());
    }
}
