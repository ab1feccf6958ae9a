//! Container detection from a payload's leading bytes.
//!
//! The extraction tool picks whatever audio stream is best, so the container
//! of a raw download is not known in advance. Only the magic numbers needed
//! to decide "already MP3 or not" (and to name intermediates) are checked.

use std::path::Path;

use tokio::io::AsyncReadExt;

/// Bytes needed to recognise every supported container.
pub const SNIFF_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp3,
    Mp4,
    WebM,
    Ogg,
    Wav,
    Unknown,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp3 => "mp3",
            Container::Mp4 => "m4a",
            Container::WebM => "webm",
            Container::Ogg => "ogg",
            Container::Wav => "wav",
            Container::Unknown => "bin",
        }
    }
}

/// Classifies a payload by its first bytes.
pub fn sniff(head: &[u8]) -> Container {
    if head.starts_with(b"ID3") {
        return Container::Mp3;
    }
    // Bare MPEG audio frame: 11 set sync bits
    if head.len() >= 2 && head[0] == 0xFF && (head[1] & 0xE0) == 0xE0 {
        return Container::Mp3;
    }
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        return Container::Mp4;
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Container::WebM;
    }
    if head.starts_with(b"OggS") {
        return Container::Ogg;
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WAVE" {
        return Container::Wav;
    }
    Container::Unknown
}

/// Reads the head of `path` and classifies it.
pub async fn sniff_file(path: &Path) -> std::io::Result<Container> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = [0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let read = file.read(&mut head[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(sniff(&head[..filled]))
}
