//! Extension-based MIME detection.
//!
//! A static table keyed on the (lowercased) file extension stands in for a
//! magic-number database; for a static-file tree the extension is
//! authoritative in practice.

use std::path::Path;

const DEFAULT: &str = "application/octet-stream";

pub(crate) fn from_path(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return DEFAULT;
    };

    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "txt" | "md" => "text/plain",
        "csv" => "text/csv",
        "xml" => "text/xml",

        "json" => "application/json",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",

        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",

        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",

        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",

        _ => DEFAULT,
    }
}

/// `text/*` types get `; charset=UTF-8` appended by the response builder.
#[inline(always)]
pub(crate) fn is_text(mime: &str) -> bool {
    mime.starts_with("text/")
}
