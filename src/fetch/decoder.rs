//! Streaming xz decompression.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::{VaultError, VaultResult};
use crate::image::{ProgressMonitor, ProgressPhase};

/// Streams an `.xz` archive to a decoded file.
///
/// Progress is measured against the compressed input, since the decoded size
/// is not known up front. The source file is left in place; callers decide
/// whether to delete it.
pub struct XzDecoder;

impl XzDecoder {
    pub fn decode_to(source: &Path, dest: &Path, monitor: &ProgressMonitor) -> VaultResult<()> {
        let failed = |reason: String| VaultError::DecodeFailed {
            path: source.to_path_buf(),
            reason,
        };

        let input = File::open(source).map_err(|e| failed(e.to_string()))?;
        let compressed_len = input.metadata().map_err(|e| failed(e.to_string()))?.len();
        let mut decoder = xz2::read::XzDecoder::new(input);
        let mut output = File::create(dest)
            .map_err(|e| failed(format!("cannot create {}: {e}", dest.display())))?;

        let mut buffer = vec![0u8; 64 * 1024];
        let mut last_percent = i32::MIN;
        loop {
            let n = decoder.read(&mut buffer).map_err(|e| failed(e.to_string()))?;
            if n == 0 {
                break;
            }
            output
                .write_all(&buffer[..n])
                .map_err(|e| failed(e.to_string()))?;

            let percent = if compressed_len > 0 {
                ((decoder.total_in() * 100) / compressed_len).min(100) as i32
            } else {
                -1
            };
            if percent != last_percent {
                last_percent = percent;
                monitor(ProgressPhase::Decode, percent);
            }
        }

        output.flush().map_err(|e| failed(e.to_string()))?;
        if compressed_len > 0 && last_percent != 100 {
            monitor(ProgressPhase::Decode, 100);
        }
        Ok(())
    }
}
