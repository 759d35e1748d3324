//! Encoder command template expansion

use std::ffi::OsString;
use std::path::Path;

use crate::error::{Result, StreamError};

/// Program name in rule templates that is swapped for the configured encoder
const DEFAULT_ENCODER: &str = "ffmpeg";

/// Expand a rule command into program + arguments.
///
/// The template is split on whitespace before substitution, so a source
/// path containing spaces stays a single argument.
pub fn build_command(
    template: &str,
    path: &Path,
    bit_rate: u32,
    encoder_path: Option<&Path>,
) -> Result<Vec<OsString>> {
    let mut args: Vec<OsString> = Vec::new();

    for (i, part) in template.split_whitespace().enumerate() {
        if i == 0 && part == DEFAULT_ENCODER {
            if let Some(encoder) = encoder_path {
                args.push(encoder.as_os_str().to_owned());
                continue;
            }
        }

        let arg = if part == "%s" {
            path.as_os_str().to_owned()
        } else {
            let bit_rate = bit_rate.to_string();
            OsString::from(
                part.replace("%s", &path.to_string_lossy())
                    .replace("%b", &bit_rate),
            )
        };
        args.push(arg);
    }

    if args.is_empty() {
        return Err(StreamError::Generation("empty encoder command".to_string()));
    }
    Ok(args)
}
