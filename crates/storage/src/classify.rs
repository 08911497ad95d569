#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileClass {
    pub extension: &'static str,
    pub mime: &'static str,
}

/// Infers a file type from raw attachment content.
pub trait AttachmentClassifier: Send + Sync {
    fn classify(&self, bytes: &[u8]) -> Option<FileClass>;
}

/// Recognises a handful of common formats by their leading signature bytes.
pub struct MagicBytesClassifier;

const PNG: FileClass = FileClass {
    extension: "png",
    mime: "image/png",
};
const JPEG: FileClass = FileClass {
    extension: "jpg",
    mime: "image/jpeg",
};
const GIF: FileClass = FileClass {
    extension: "gif",
    mime: "image/gif",
};
const WEBP: FileClass = FileClass {
    extension: "webp",
    mime: "image/webp",
};
const PDF: FileClass = FileClass {
    extension: "pdf",
    mime: "application/pdf",
};
const ZIP: FileClass = FileClass {
    extension: "zip",
    mime: "application/zip",
};
const MP4: FileClass = FileClass {
    extension: "mp4",
    mime: "video/mp4",
};
const OGG: FileClass = FileClass {
    extension: "ogg",
    mime: "audio/ogg",
};

impl AttachmentClassifier for MagicBytesClassifier {
    fn classify(&self, bytes: &[u8]) -> Option<FileClass> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            return Some(PNG);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(JPEG);
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some(GIF);
        }
        if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP".as_slice()) {
            return Some(WEBP);
        }
        if bytes.starts_with(b"%PDF-") {
            return Some(PDF);
        }
        if bytes.starts_with(b"PK\x03\x04") {
            return Some(ZIP);
        }
        if bytes.get(4..8) == Some(b"ftyp".as_slice()) {
            return Some(MP4);
        }
        if bytes.starts_with(b"OggS") {
            return Some(OGG);
        }
        None
    }
}
