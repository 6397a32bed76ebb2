#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Uploaded as-is; the knowledge base parses the format itself.
    Native,
    /// Decoded as UTF-8 and uploaded as plain text.
    ConvertToText,
    Unsupported,
}

const KINDS: &[(&str, FileKind)] = &[
    ("txt", FileKind::Native),
    ("md", FileKind::Native),
    ("markdown", FileKind::Native),
    ("pdf", FileKind::Native),
    ("html", FileKind::Native),
    ("htm", FileKind::Native),
    ("xlsx", FileKind::Native),
    ("xls", FileKind::Native),
    ("csv", FileKind::Native),
    ("xml", FileKind::ConvertToText),
    ("eml", FileKind::ConvertToText),
    ("json", FileKind::ConvertToText),
    ("log", FileKind::ConvertToText),
    ("rst", FileKind::ConvertToText),
    ("tsv", FileKind::ConvertToText),
    ("yaml", FileKind::ConvertToText),
    ("yml", FileKind::ConvertToText),
];

pub fn kind_for_extension(extension: &str) -> FileKind {
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();
    KINDS
        .iter()
        .find(|(candidate, _)| *candidate == extension)
        .map(|(_, kind)| *kind)
        .unwrap_or(FileKind::Unsupported)
}

/// Lower-cased text after the last dot, if the name has a non-empty one.
pub fn extension_of(name: &str) -> Option<String> {
    let (stem, extension) = name.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

/// Collapses repeated trailing extensions (`report.pdf.PDF` -> `report.pdf`).
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.trim();
    let mut parts: Vec<&str> = trimmed.split('.').collect();
    while parts.len() > 2 {
        let last = parts[parts.len() - 1];
        let previous = parts[parts.len() - 2];
        if last.is_empty() || !last.eq_ignore_ascii_case(previous) {
            break;
        }
        parts.pop();
    }
    parts.join(".")
}
