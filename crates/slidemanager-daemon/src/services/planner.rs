//! Library scanning and change detection feeding the job planner.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::store::FileRow;

const PPTX_EXT: &str = "pptx";
const SLIDE_PREFIX: &str = "ppt/slides/slide";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileScan {
    pub path: PathBuf,
    pub size_bytes: i64,
    pub mtime_epoch: i64,
}

/// Discover `.pptx` files under a root. Non-recursive unless asked; the
/// whitelist's `recursive` flag is the caller's decision, not ours.
pub fn scan_files_under(root: &Path, recursive: bool) -> io::Result<Vec<FileScan>> {
    let mut out = Vec::new();
    scan_dir(root, recursive, &mut out)?;
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn scan_dir(dir: &Path, recursive: bool, out: &mut Vec<FileScan>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                // A vanished subdirectory mid-walk is not fatal.
                let _ = scan_dir(&path, recursive, out);
            }
            continue;
        }
        if let Some(scan) = stat_pptx(&path) {
            out.push(scan);
        }
    }
    Ok(())
}

/// Stat an explicit list of files, dropping anything that is not a readable
/// `.pptx` regular file.
pub fn scan_specific_files(paths: &[PathBuf]) -> Vec<FileScan> {
    let mut out: Vec<FileScan> = paths.iter().filter_map(|p| stat_pptx(p)).collect();
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

fn stat_pptx(path: &Path) -> Option<FileScan> {
    let is_pptx = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case(PPTX_EXT))
        .unwrap_or(false);
    if !is_pptx {
        return None;
    }
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    Some(FileScan {
        path: resolved,
        size_bytes: meta.len() as i64,
        mtime_epoch: mtime,
    })
}

/// True iff the scanned size or mtime differs from the persisted row (or the
/// file has never been seen).
pub fn file_changed(prev: Option<&FileRow>, scan: &FileScan) -> bool {
    match prev {
        None => true,
        Some(row) => row.size_bytes != scan.size_bytes || row.mtime_epoch != scan.mtime_epoch,
    }
}

/// Count slides without parsing any XML: the number of
/// `ppt/slides/slideN.xml` entries in the archive.
pub fn slide_count(pptx_path: &Path) -> Result<u32, zip::result::ZipError> {
    let file = File::open(pptx_path)?;
    let archive = zip::ZipArchive::new(file)?;
    let count = archive
        .file_names()
        .filter(|name| name.starts_with(SLIDE_PREFIX) && name.ends_with(".xml"))
        .count();
    Ok(count as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn touch_pptx(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).expect("create");
        let mut zw = zip::ZipWriter::new(file);
        let opts = zip::write::SimpleFileOptions::default();
        zw.start_file("ppt/slides/slide1.xml", opts).expect("entry");
        zw.write_all(b"<p:sld/>").expect("write");
        zw.finish().expect("finish");
        path
    }

    #[test]
    fn scan_is_non_recursive_by_default() {
        let temp = TempDir::new().expect("temp dir");
        touch_pptx(temp.path(), "top.pptx");
        std::fs::create_dir(temp.path().join("sub")).expect("mkdir");
        touch_pptx(&temp.path().join("sub"), "nested.pptx");
        std::fs::write(temp.path().join("notes.txt"), b"hi").expect("txt");

        let flat = scan_files_under(temp.path(), false).expect("scan");
        assert_eq!(flat.len(), 1, "only the top-level pptx");
        assert!(flat[0].path.ends_with("top.pptx"));

        let deep = scan_files_under(temp.path(), true).expect("recursive scan");
        assert_eq!(deep.len(), 2, "recursion picks up the nested file");
    }

    #[test]
    fn scan_specific_files_filters_non_pptx() {
        let temp = TempDir::new().expect("temp dir");
        let good = touch_pptx(temp.path(), "deck.pptx");
        let bad = temp.path().join("deck.docx");
        std::fs::write(&bad, b"nope").expect("write");
        let scans = scan_specific_files(&[good.clone(), bad, temp.path().join("missing.pptx")]);
        assert_eq!(scans.len(), 1);
        assert!(scans[0].size_bytes > 0);
    }

    #[test]
    fn file_changed_checks_size_and_mtime() {
        let scan = FileScan {
            path: PathBuf::from("/x.pptx"),
            size_bytes: 100,
            mtime_epoch: 1000,
        };
        assert!(file_changed(None, &scan), "new files always count as changed");
        let same = FileRow {
            file_id: 1,
            size_bytes: 100,
            mtime_epoch: 1000,
        };
        assert!(!file_changed(Some(&same), &scan));
        let touched = FileRow {
            file_id: 1,
            size_bytes: 100,
            mtime_epoch: 2000,
        };
        assert!(file_changed(Some(&touched), &scan));
    }

    #[test]
    fn slide_count_counts_slide_entries_only() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("multi.pptx");
        let file = File::create(&path).expect("create");
        let mut zw = zip::ZipWriter::new(file);
        let opts = zip::write::SimpleFileOptions::default();
        for name in [
            "ppt/slides/slide1.xml",
            "ppt/slides/slide2.xml",
            "ppt/slides/slide3.xml",
            "ppt/slides/_rels/slide1.xml.rels",
            "ppt/presentation.xml",
        ] {
            zw.start_file(name, opts).expect("entry");
            zw.write_all(b"<x/>").expect("write");
        }
        zw.finish().expect("finish");
        assert_eq!(slide_count(&path).expect("count"), 3);
    }
}
