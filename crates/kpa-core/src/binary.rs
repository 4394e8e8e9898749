//! Binary file detection by sampling leading bytes.

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Number of leading bytes inspected.
pub const SAMPLE_SIZE: usize = 1024;

/// Returns `true` if the first [`SAMPLE_SIZE`] bytes contain a NUL byte.
///
/// Any read error classifies the file as binary so it is left out of prompts.
pub fn is_binary(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return true;
    };
    let mut sample = Vec::with_capacity(SAMPLE_SIZE);
    match file.take(SAMPLE_SIZE as u64).read_to_end(&mut sample) {
        Ok(_) => sample.contains(&0),
        Err(_) => true,
    }
}
