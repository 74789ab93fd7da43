//! Package-level reads on an xlsx container that the cell reader does not
//! expose: which sheets carry drawings, and the embedded media itself.

use crate::models::workbook::EmbeddedImage;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::LazyLock;
use zip::ZipArchive;
use zip::result::ZipError;

/// Largest single image carried into the parsed workbook.
pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
/// Upper bound on all embedded media combined.
pub const MAX_MEDIA_BYTES: u64 = 25 * 1024 * 1024;
/// Package parts (workbook.xml, rels) are small; anything bigger is skipped.
const MAX_PART_BYTES: u64 = 4 * 1024 * 1024;

static ELEMENT_SHEET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?sheet\b[^>]*>").expect("sheet regex"));
static ELEMENT_RELATIONSHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?Relationship\b[^>]*>").expect("relationship regex"));
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([\w:]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("attribute regex")
});

fn attributes(tag: &str) -> HashMap<&str, &str> {
    ATTRIBUTE
        .captures_iter(tag)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str();
            let value = caps.get(2).or_else(|| caps.get(3))?.as_str();
            Some((key, value))
        })
        .collect()
}

fn read_part(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Option<String>, ZipError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut raw = Vec::new();
    (&mut entry)
        .take(MAX_PART_BYTES)
        .read_to_end(&mut raw)
        .map_err(ZipError::Io)?;
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

/// Resolves a relationship target relative to `xl/` to its file name.
fn target_file_name(target: &str) -> &str {
    target.rsplit('/').next().unwrap_or(target)
}

/// Names of the worksheets that reference a drawing part.
pub fn sheets_with_drawings(buffer: &[u8]) -> Result<HashSet<String>, ZipError> {
    let mut archive = ZipArchive::new(Cursor::new(buffer))?;
    let mut result = HashSet::new();

    let Some(workbook) = read_part(&mut archive, "xl/workbook.xml")? else {
        return Ok(result);
    };
    let Some(workbook_rels) = read_part(&mut archive, "xl/_rels/workbook.xml.rels")? else {
        return Ok(result);
    };

    let targets: HashMap<String, String> = ELEMENT_RELATIONSHIP
        .find_iter(&workbook_rels)
        .filter_map(|m| {
            let attrs = attributes(m.as_str());
            Some((
                attrs.get("Id")?.to_string(),
                target_file_name(attrs.get("Target")?).to_string(),
            ))
        })
        .collect();

    for m in ELEMENT_SHEET.find_iter(&workbook) {
        let attrs = attributes(m.as_str());
        let (Some(name), Some(rel_id)) = (attrs.get("name"), attrs.get("r:id")) else {
            continue;
        };
        let Some(file) = targets.get(*rel_id) else {
            continue;
        };
        let rels_path = format!("xl/worksheets/_rels/{}.rels", file);
        let has_drawing = read_part(&mut archive, &rels_path)?
            .is_some_and(|rels| rels.contains("relationships/drawing"));
        if has_drawing {
            result.insert(unescape_attr(name));
        }
    }

    Ok(result)
}

fn unescape_attr(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        "emf" => "image/x-emf",
        "wmf" => "image/x-wmf",
        _ => "application/octet-stream",
    }
}

/// Embedded media found under `xl/media/`.
#[derive(Debug, Default)]
pub struct MediaExtraction {
    pub images: Vec<EmbeddedImage>,
    pub warnings: Vec<String>,
}

/// Pulls images out of `xl/media/`, base64 encoded. Oversized images and
/// anything past the combined budget are skipped with a warning.
pub fn extract_media(buffer: &[u8]) -> Result<MediaExtraction, ZipError> {
    let mut archive = ZipArchive::new(Cursor::new(buffer))?;
    let mut out = MediaExtraction::default();
    let mut remaining = MAX_MEDIA_BYTES;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if !name.starts_with("xl/media/") || entry.is_dir() {
            continue;
        }
        let short_name = target_file_name(&name).to_string();

        if entry.size() > MAX_IMAGE_BYTES {
            out.warnings
                .push(format!("Image {} skipped: exceeds {} bytes", short_name, MAX_IMAGE_BYTES));
            continue;
        }
        if entry.size() > remaining {
            out.warnings
                .push(format!("Image {} skipped: media budget exhausted", short_name));
            continue;
        }

        let mut data = Vec::new();
        // Declared sizes can lie; bound the actual read as well.
        (&mut entry)
            .take(MAX_IMAGE_BYTES.min(remaining) + 1)
            .read_to_end(&mut data)
            .map_err(ZipError::Io)?;
        if data.len() as u64 > MAX_IMAGE_BYTES.min(remaining) {
            out.warnings
                .push(format!("Image {} skipped: exceeds size limit", short_name));
            continue;
        }
        remaining -= data.len() as u64;

        out.images.push(EmbeddedImage {
            content_type: content_type_for(&short_name).to_string(),
            encoding: "base64".to_string(),
            size: data.len(),
            data: STANDARD.encode(&data),
            name: short_name,
        });
    }

    Ok(out)
}
