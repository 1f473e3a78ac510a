use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use url::Url;

const DEFAULT_FILENAME: &str = "download.bin";

/// Maps each URL to its target file.
///
/// With one URL, `provided` may name the file itself or an existing directory
/// (or a path ending in a separator) to download into. With several URLs it is
/// always a directory, created if missing.
pub fn infer_output_paths(provided: Option<PathBuf>, urls: &[Url]) -> Result<Vec<PathBuf>> {
    if urls.is_empty() {
        return Err(anyhow!("at least one URL is required to infer output"));
    }

    let paths: Vec<PathBuf> = match provided {
        Some(path) if urls.len() == 1 && !is_directory_like(&path) => vec![path],
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {:?}", dir))?;
            urls.iter().map(|url| dir.join(filename_from_url(url))).collect()
        }
        None => urls.iter().map(|url| PathBuf::from(filename_from_url(url))).collect(),
    };

    let mut seen = HashSet::new();
    for path in &paths {
        if !seen.insert(path) {
            return Err(anyhow!("several URLs would be saved as {:?}", path));
        }
    }
    Ok(paths)
}

fn is_directory_like(path: &Path) -> bool {
    path.is_dir()
        || path
            .to_str()
            .map(|s| s.ends_with(std::path::MAIN_SEPARATOR))
            .unwrap_or(false)
}

fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .last()
                .map(|s| s.to_string())
        })
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}

pub fn format_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut val = value as f64;
    let mut unit = 0usize;
    while val >= 1024.0 && unit < UNITS.len() - 1 {
        val /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value, UNITS[unit])
    } else {
        format!("{val:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("url")
    }

    #[test]
    fn filename_comes_from_last_path_segment() {
        let paths = infer_output_paths(None, &[url("https://example.com/pub/archive.tar.gz")])
            .expect("paths");
        assert_eq!(paths, vec![PathBuf::from("archive.tar.gz")]);
    }

    #[test]
    fn bare_host_falls_back_to_default_name() {
        let paths = infer_output_paths(None, &[url("https://example.com/")]).expect("paths");
        assert_eq!(paths, vec![PathBuf::from(DEFAULT_FILENAME)]);
    }

    #[test]
    fn single_url_with_file_path_is_used_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("custom.bin");
        let paths = infer_output_paths(Some(target.clone()), &[url("https://example.com/a.iso")])
            .expect("paths");
        assert_eq!(paths, vec![target]);
    }

    #[test]
    fn several_urls_go_into_a_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out");
        let paths = infer_output_paths(
            Some(out.clone()),
            &[url("https://example.com/a.iso"), url("https://example.com/b.iso")],
        )
        .expect("paths");
        assert!(out.is_dir());
        assert_eq!(paths, vec![out.join("a.iso"), out.join("b.iso")]);
    }

    #[test]
    fn colliding_names_are_rejected() {
        let result = infer_output_paths(
            None,
            &[url("https://a.example.com/x.bin"), url("https://b.example.com/x.bin")],
        );
        assert!(result.is_err());
    }

    #[test]
    fn format_bytes_scales_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(1_048_576), "1.00 MiB");
    }
}
