use clap::Parser;
use std::path::PathBuf;

use crate::entities::payload::Edit;

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Formats: PNG, JPEG, TIFF, TGA (image 0.25)\n",
    "Target:  ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Image document cache: inspect, edit and save images through the registry
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Images to open (PNG, JPEG, TIFF, TGA)
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Decode pixels too, not just the header
    #[arg(short = 'F', long = "full")]
    pub full: bool,

    /// Edit to apply to every image, in order (rotate-left, rotate-right, mirror, flip)
    #[arg(short = 'e', long = "edit", value_name = "EDIT", value_parser = parse_edit)]
    pub edits: Vec<Edit>,

    /// Write edited images into DIR instead of discarding the changes
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Overwrite edited images in place
    #[arg(long = "in-place", conflicts_with = "output_dir")]
    pub in_place: bool,

    /// Unreferenced entries kept per cache map (overrides config)
    #[arg(long = "floor", value_name = "N")]
    pub eviction_floor: Option<usize>,

    /// Decoder worker threads (overrides config)
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Seconds to wait for decodes before giving up
    #[arg(long = "timeout", value_name = "SECS", default_value = "30")]
    pub timeout_secs: u64,

    /// Write the effective configuration to the config file and exit
    #[arg(long = "write-config")]
    pub write_config: bool,

    /// Enable debug logging to file (default: imgcache.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

fn parse_edit(s: &str) -> Result<Edit, String> {
    match s.to_ascii_lowercase().as_str() {
        "rotate-left" | "left" => Ok(Edit::RotateLeft),
        "rotate-right" | "right" => Ok(Edit::RotateRight),
        "mirror" => Ok(Edit::Mirror),
        "flip" => Ok(Edit::Flip),
        other => Err(format!("unknown edit '{}' (rotate-left, rotate-right, mirror, flip)", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_edits_in_order() {
        let args = Args::parse_from(["imgcache", "a.png", "-e", "left", "--edit", "Mirror", "-F"]);
        assert_eq!(args.edits, vec![Edit::RotateLeft, Edit::Mirror]);
        assert!(args.full);
        assert_eq!(args.files, vec![PathBuf::from("a.png")]);
    }

    #[test]
    fn test_unknown_edit_rejected() {
        assert!(Args::try_parse_from(["imgcache", "-e", "sharpen"]).is_err());
    }

    #[test]
    fn test_output_conflicts_with_in_place() {
        assert!(Args::try_parse_from(["imgcache", "-o", "out", "--in-place"]).is_err());
    }

    #[test]
    fn test_log_flag_optional_value() {
        let args = Args::parse_from(["imgcache", "-l"]);
        assert_eq!(args.log_file, Some(None));
        let args = Args::parse_from(["imgcache", "--log", "x.log"]);
        assert_eq!(args.log_file, Some(Some(PathBuf::from("x.log"))));
    }
}
