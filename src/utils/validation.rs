use std::path::Path;

pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const XLS_MIME: &str = "application/vnd.ms-excel";
pub const GENERIC_BINARY_MIME: &str = "application/octet-stream";

/// MIME types accepted for spreadsheet uploads. Browsers frequently send the
/// generic binary type, so it is accepted and the signature check decides.
pub const ALLOWED_MIME_TYPES: &[&str] = &[XLSX_MIME, XLS_MIME, GENERIC_BINARY_MIME];

/// ZIP local file header (OOXML container)
const ZIP_SIGNATURE: &[u8] = &[0x50, 0x4B, 0x03, 0x04];
/// OLE2 compound document header (BIFF8 workbooks)
const OLE_SIGNATURE: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Spreadsheet container formats the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadsheetKind {
    Xlsx,
    Xls,
}

impl SpreadsheetKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "xlsx" => Some(SpreadsheetKind::Xlsx),
            "xls" => Some(SpreadsheetKind::Xls),
            _ => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        file_extension(name).and_then(|ext| Self::from_extension(&ext))
    }

    /// Detects the container from its leading bytes.
    pub fn from_signature(header: &[u8]) -> Option<Self> {
        if header.starts_with(ZIP_SIGNATURE) {
            Some(SpreadsheetKind::Xlsx)
        } else if header.starts_with(OLE_SIGNATURE) {
            Some(SpreadsheetKind::Xls)
        } else {
            None
        }
    }

    pub fn signature(self) -> &'static [u8] {
        match self {
            SpreadsheetKind::Xlsx => ZIP_SIGNATURE,
            SpreadsheetKind::Xls => OLE_SIGNATURE,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            SpreadsheetKind::Xlsx => XLSX_MIME,
            SpreadsheetKind::Xls => XLS_MIME,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SpreadsheetKind::Xlsx => "xlsx",
            SpreadsheetKind::Xls => "xls",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Lower-cased extension of the final path component, if any.
pub fn file_extension(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Strips parameters and case from a content type ("Foo/Bar; x=y" -> "foo/bar").
pub fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

pub fn is_allowed_mime(content_type: &str) -> bool {
    let normalized = normalize_mime(content_type);
    ALLOWED_MIME_TYPES.iter().any(|&allowed| allowed == normalized)
}

/// Sanitizes filename to prevent path traversal and injection attacks
/// Returns the sanitized filename or an error if the name is unusable
pub fn sanitize_filename(filename: &str) -> Result<String, ValidationError> {
    // Only the last component survives, whichever separator the client used
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        });
    }

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path traversal attempt detected: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';')
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if sanitized.starts_with('.') {
        return Err(ValidationError {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        });
    }

    Ok(sanitized)
}

/// Checks if file content appears to be executable
pub fn is_executable_content(header: &[u8]) -> bool {
    if header.len() < 4 {
        return false;
    }

    // ELF binary (Linux)
    if header.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        return true;
    }

    // PE/COFF (Windows .exe, .dll)
    if header.starts_with(&[0x4D, 0x5A]) {
        return true;
    }

    // Mach-O (macOS)
    if header.starts_with(&[0xFE, 0xED, 0xFA, 0xCE])
        || header.starts_with(&[0xFE, 0xED, 0xFA, 0xCF])
        || header.starts_with(&[0xCE, 0xFA, 0xED, 0xFE])
        || header.starts_with(&[0xCF, 0xFA, 0xED, 0xFE])
    {
        return true;
    }

    // Shebang (shell scripts)
    header.starts_with(b"#!")
}
