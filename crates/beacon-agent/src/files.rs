//! Blocking filesystem helpers behind the share endpoints. Callers run
//! these through `spawn_blocking`; nothing here touches the async runtime.

use std::fs;
use std::io;
use std::path::Path;

use beacon_types::models::{FileEntry, ListingPayload, SearchPayload};

use crate::paths::to_client_path;

pub const LIST_MAX_ENTRIES_CAP: usize = 5000;
pub const SEARCH_MAX_RESULTS_CAP: usize = 1000;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "flv", "m4v"];
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff", "avif", "heic", "heif",
];
const WORD_EXTENSIONS: &[&str] = &["docx", "doc", "docm", "dotx", "dotm", "odt", "rtf"];
const EXCEL_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "xlsb", "ods", "csv", "tsv"];
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown", "mdown", "mkd", "mkdn", "mdx"];
const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "mjs", "cjs", "ts", "tsx", "jsx", "java", "go", "rs", "rb", "php", "cs", "cpp",
    "cxx", "cc", "c", "h", "hpp", "lua", "sql", "sh", "bash", "zsh", "ps1", "bat", "cmd", "yaml",
    "yml", "json", "toml", "ini", "cfg", "conf", "xml", "css", "scss", "sass", "less", "vue",
    "svelte",
];
const TEXT_EXTENSIONS: &[&str] = &["txt", "log", "text", "rst", "asc", "readme", "license"];

fn extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Coarse classification clients use for icons and preview routing.
pub fn get_file_type(filename: &str) -> &'static str {
    let ext = extension(filename);
    let base = Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        e if VIDEO_EXTENSIONS.contains(&e) => "video",
        "svg" => "svg",
        e if IMAGE_EXTENSIONS.contains(&e) => "image",
        "pdf" => "pdf",
        e if WORD_EXTENSIONS.contains(&e) => "word",
        e if EXCEL_EXTENSIONS.contains(&e) => "excel",
        e if MARKDOWN_EXTENSIONS.contains(&e) => "markdown",
        "html" | "htm" => "html",
        e if CODE_EXTENSIONS.contains(&e)
            || matches!(base.as_str(), "dockerfile" | "makefile" | ".env" | ".gitignore") =>
        {
            "code"
        }
        e if TEXT_EXTENSIONS.contains(&e) => "text",
        _ => "other",
    }
}

/// Mime type for stream/download responses. Code-like content is forced to
/// text/plain so browsers render instead of downloading.
pub fn guess_mimetype(filename: &str) -> String {
    match get_file_type(filename) {
        "code" | "text" | "markdown" => return "text/plain; charset=utf-8".to_string(),
        "html" => return "text/html; charset=utf-8".to_string(),
        "svg" => return "image/svg+xml".to_string(),
        _ => {}
    }
    let mime = match extension(filename).as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "flv" => "video/x-flv",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tiff" => "image/tiff",
        "avif" => "image/avif",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

fn entry_to_item(root: &Path, entry_path: &Path, is_dir: bool) -> Option<FileEntry> {
    let name = entry_path.file_name()?.to_string_lossy().into_owned();
    let path = to_client_path(entry_path, root).ok()?;
    let parent_path = entry_path
        .parent()
        .and_then(|parent| to_client_path(parent, root).ok())
        .unwrap_or_default();
    let entry_type = if is_dir {
        "directory".to_string()
    } else {
        get_file_type(&name).to_string()
    };
    Some(FileEntry {
        name,
        is_dir,
        path,
        parent_path,
        entry_type,
        device_id: None,
        share_id: None,
        share_name: None,
        device_name: None,
        stream_url: None,
        download_url: None,
    })
}

fn sort_key(entry: &FileEntry) -> (bool, String, String) {
    (!entry.is_dir, entry.name.to_lowercase(), entry.name.clone())
}

/// One directory level: directories first, case-insensitive name order,
/// truncated at `max_entries`.
pub fn list_directory(
    root: &Path,
    directory: &Path,
    max_entries: usize,
) -> io::Result<ListingPayload> {
    let limit = max_entries.clamp(1, LIST_MAX_ENTRIES_CAP);
    let mut items = Vec::new();
    for entry in fs::read_dir(directory)? {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let is_dir = file_type.is_dir();
        if let Some(item) = entry_to_item(root, &entry.path(), is_dir) {
            items.push(item);
        }
    }
    items.sort_by_key(sort_key);
    let truncated = items.len() > limit;
    items.truncate(limit);

    let current_path = to_client_path(directory, root)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "directory escapes root"))?;
    let parent_path = if directory == root {
        None
    } else {
        directory
            .parent()
            .and_then(|parent| to_client_path(parent, root).ok())
    };
    Ok(ListingPayload {
        current_path,
        parent_path,
        items,
        truncated,
        limit,
    })
}

/// Case-insensitive substring search over entry names and client-relative
/// paths, walking depth-first in deterministic order when recursive.
pub fn search_entries(
    root: &Path,
    start_directory: &Path,
    query: &str,
    recursive: bool,
    max_results: usize,
) -> io::Result<SearchPayload> {
    let base_path = to_client_path(start_directory, root)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "directory escapes root"))?;
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Ok(SearchPayload {
            query: query.to_string(),
            base_path,
            recursive,
            items: vec![],
            truncated: false,
        });
    }

    let limit = max_results.clamp(1, SEARCH_MAX_RESULTS_CAP);
    let mut items: Vec<FileEntry> = Vec::new();
    let mut truncated = false;

    fn matches(item: &FileEntry, needle: &str) -> bool {
        item.name.to_lowercase().contains(needle) || item.path.to_lowercase().contains(needle)
    }

    fn walk(
        root: &Path,
        directory: &Path,
        needle: &str,
        recursive: bool,
        limit: usize,
        items: &mut Vec<FileEntry>,
        truncated: &mut bool,
    ) {
        let Ok(read) = fs::read_dir(directory) else {
            return;
        };
        let mut dirs: Vec<std::path::PathBuf> = Vec::new();
        let mut files: Vec<std::path::PathBuf> = Vec::new();
        for entry in read.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            // Symlinked directories are not followed.
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
        dirs.sort_by_key(|path| path.file_name().map(|n| n.to_string_lossy().to_lowercase()));
        files.sort_by_key(|path| path.file_name().map(|n| n.to_string_lossy().to_lowercase()));

        for dir in &dirs {
            if let Some(item) = entry_to_item(root, dir, true) {
                if matches(&item, needle) {
                    items.push(item);
                    if items.len() >= limit {
                        *truncated = true;
                        return;
                    }
                }
            }
        }
        for file in &files {
            if let Some(item) = entry_to_item(root, file, false) {
                if matches(&item, needle) {
                    items.push(item);
                    if items.len() >= limit {
                        *truncated = true;
                        return;
                    }
                }
            }
        }
        if recursive {
            for dir in &dirs {
                walk(root, dir, needle, recursive, limit, items, truncated);
                if *truncated {
                    return;
                }
            }
        }
    }

    walk(
        root,
        start_directory,
        &needle,
        recursive,
        limit,
        &mut items,
        &mut truncated,
    );

    items.sort_by(|a, b| {
        (!a.is_dir, a.path.to_lowercase()).cmp(&(!b.is_dir, b.path.to_lowercase()))
    });
    Ok(SearchPayload {
        query: query.to_string(),
        base_path,
        recursive,
        items,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("beacon_files_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn classification_covers_the_usual_suspects() {
        assert_eq!(get_file_type("movie.MKV"), "video");
        assert_eq!(get_file_type("photo.jpeg"), "image");
        assert_eq!(get_file_type("doc.pdf"), "pdf");
        assert_eq!(get_file_type("notes.md"), "markdown");
        assert_eq!(get_file_type("main.rs"), "code");
        assert_eq!(get_file_type("Makefile"), "code");
        assert_eq!(get_file_type("archive.xyz"), "other");
    }

    #[test]
    fn code_streams_as_plain_text() {
        assert_eq!(guess_mimetype("main.rs"), "text/plain; charset=utf-8");
        assert_eq!(guess_mimetype("index.html"), "text/html; charset=utf-8");
        assert_eq!(guess_mimetype("clip.mp4"), "video/mp4");
        assert_eq!(guess_mimetype("blob.bin"), "application/octet-stream");
    }

    #[test]
    fn listing_sorts_dirs_first_and_truncates() {
        let root = scratch("list");
        fs::create_dir(root.join("zeta")).unwrap();
        fs::write(root.join("alpha.txt"), b"a").unwrap();
        fs::write(root.join("beta.txt"), b"b").unwrap();

        let listing = list_directory(&root, &root, 2).unwrap();
        assert!(listing.truncated);
        assert_eq!(listing.items.len(), 2);
        assert_eq!(listing.items[0].name, "zeta");
        assert!(listing.items[0].is_dir);
        assert_eq!(listing.items[1].name, "alpha.txt");
        assert_eq!(listing.current_path, "");
        assert!(listing.parent_path.is_none());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn search_matches_names_and_paths_recursively() {
        let root = scratch("search");
        fs::create_dir_all(root.join("music/live")).unwrap();
        fs::write(root.join("music/live/set.flac"), b"x").unwrap();
        fs::write(root.join("readme.txt"), b"x").unwrap();

        let found = search_entries(&root, &root, "live", true, 100).unwrap();
        let paths: Vec<_> = found.items.iter().map(|item| item.path.clone()).collect();
        assert!(paths.contains(&"music/live".to_string()));
        assert!(paths.contains(&"music/live/set.flac".to_string()));

        let shallow = search_entries(&root, &root, "set", false, 100).unwrap();
        assert!(shallow.items.is_empty());

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn search_caps_results_and_flags_truncation() {
        let root = scratch("cap");
        for idx in 0..5 {
            fs::write(root.join(format!("hit_{idx}.txt")), b"x").unwrap();
        }
        let found = search_entries(&root, &root, "hit", true, 3).unwrap();
        assert_eq!(found.items.len(), 3);
        assert!(found.truncated);
        fs::remove_dir_all(&root).unwrap();
    }
}
