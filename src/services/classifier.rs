//! Detection of Chromium application roots.
//!
//! A directory is an application root when one of the [`MARKER_FILES`] sits
//! directly inside it. The runtime version is read from the `VS_FIXEDFILEINFO`
//! block embedded in the main kernel DLL; every failure on that path degrades
//! to [`UNKNOWN_VERSION`].

use camino::{Utf8Path, Utf8PathBuf};
use std::fs::File;
use std::io::{BufReader, Read};

/// Files whose presence marks a directory as a Chromium application root.
pub const MARKER_FILES: [&str; 9] = [
    "chrome.dll",
    "chrome.exe",
    "msedge.dll",
    "msedge.exe",
    "brave.exe",
    "brave.dll",
    "chrome_elf.dll",
    "widevinecdmadapter.dll",
    "libcef.dll",
];

/// Kernel DLLs that carry the runtime version, in lookup order.
pub const VERSION_FILES: [&str; 4] = ["chrome.dll", "msedge.dll", "brave.dll", "libcef.dll"];

pub const UNKNOWN_VERSION: &str = "unknown";

const FIXED_FILE_INFO_SIGNATURE: [u8; 4] = 0xFEEF_04BDu32.to_le_bytes();
const FIXED_FILE_INFO_STRUCT_VERSION: u32 = 0x0001_0000;
// signature, struct version, file version MS, file version LS
const FIXED_FILE_INFO_PREFIX: usize = 16;
const READ_CHUNK: usize = 64 * 1024;

/// Returns true if any marker file exists directly in `dir`.
pub fn is_chromium_app(dir: &Utf8Path) -> bool {
    MARKER_FILES.iter().any(|marker| dir.join(marker).exists())
}

/// First version-bearing kernel DLL present in `dir`.
pub fn find_version_file(dir: &Utf8Path) -> Option<Utf8PathBuf> {
    VERSION_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Version of the kernel in `dir`, or [`UNKNOWN_VERSION`].
pub fn detect_version(dir: &Utf8Path) -> String {
    match find_version_file(dir) {
        Some(path) => extract_version(&path),
        None => UNKNOWN_VERSION.to_string(),
    }
}

/// Read the file version of a PE image as `major.minor.build.patch`.
///
/// Never fails: unreadable, non-PE or resource-less files yield
/// [`UNKNOWN_VERSION`].
pub fn extract_version(binary: &Utf8Path) -> String {
    match read_fixed_file_version(binary) {
        Ok(Some(version)) => version,
        Ok(None) => {
            tracing::debug!("No version resource in {}", binary);
            UNKNOWN_VERSION.to_string()
        }
        Err(e) => {
            tracing::debug!("Could not read version of {}: {}", binary, e);
            UNKNOWN_VERSION.to_string()
        }
    }
}

fn read_fixed_file_version(binary: &Utf8Path) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(File::open(binary)?);

    let mut magic = [0u8; 2];
    if reader.read_exact(&mut magic).is_err() || &magic != b"MZ" {
        return Ok(None);
    }

    // Slide a window over the file, keeping enough tail bytes that a block
    // straddling two chunks is still seen whole.
    let mut window: Vec<u8> = magic.to_vec();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            return Ok(parse_fixed_file_info(&window));
        }
        window.extend_from_slice(&chunk[..read]);

        if let Some(version) = parse_fixed_file_info(&window) {
            return Ok(Some(version));
        }

        let keep = FIXED_FILE_INFO_PREFIX - 1;
        if window.len() > keep {
            window.drain(..window.len() - keep);
        }
    }
}

/// Find a `VS_FIXEDFILEINFO` block in `bytes` and format its file version.
pub fn parse_fixed_file_info(bytes: &[u8]) -> Option<String> {
    let mut offset = 0;
    while offset + FIXED_FILE_INFO_PREFIX <= bytes.len() {
        let rest = &bytes[offset..];
        let found = rest
            .windows(FIXED_FILE_INFO_SIGNATURE.len())
            .position(|w| w == FIXED_FILE_INFO_SIGNATURE)?;
        let start = offset + found;
        if start + FIXED_FILE_INFO_PREFIX > bytes.len() {
            return None;
        }

        let word = |at: usize| {
            u32::from_le_bytes([
                bytes[start + at],
                bytes[start + at + 1],
                bytes[start + at + 2],
                bytes[start + at + 3],
            ])
        };

        if word(4) == FIXED_FILE_INFO_STRUCT_VERSION {
            let ms = word(8);
            let ls = word(12);
            return Some(format!(
                "{}.{}.{}.{}",
                ms >> 16,
                ms & 0xFFFF,
                ls >> 16,
                ls & 0xFFFF
            ));
        }

        offset = start + 1;
    }
    None
}
