//! Argument parsing: a `clap::Command` builder exposing exactly the flags
//! the dedup engine understands, plus the NUL-delimited stdin file-list
//! reader.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::engine::RunConfig;
use crate::error::{Error, Result};

const DEFAULT_BLOCK_SIZE: u64 = 4096;
const DEFAULT_REF_LIMIT: usize = 500;
const DEFAULT_CHUNK_LIMIT: u64 = 128 * 1024 * 1024;
const DEFAULT_SORT_MEM_MIB: u64 = 600;

pub fn command() -> Command {
    Command::new("blkdedup")
        .about("Block-level offline deduplicator for copy-on-write filesystems")
        .version(env!("CARGO_PKG_VERSION"))
        .author("hackiado <seidogitan@example.com>")
        .arg(
            Arg::new("hash-file")
                .short('s')
                .long("hash-file")
                .help("Prefix for external-sort run files (<path>.NNNN)")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("chunk-file")
                .short('c')
                .long("chunk-file")
                .help("Scratch chunk file path")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("temp-size")
                .short('t')
                .long("temp-size")
                .help("Scratch chunk file size ceiling, in bytes")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("sort-mem")
                .short('m')
                .long("sort-mem")
                .help("Hash-storage RAM budget, in MiB")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("ref-limit")
                .short('r')
                .long("ref-limit")
                .help("Maximum references per physical block and descriptor LRU size")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("block-size")
                .short('b')
                .long("block-size")
                .help("Logical block size in bytes; must match the filesystem")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("no-relocate")
                .long("no-relocate")
                .help("Skip phase 3 (singleton relocation)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-dedup")
                .long("no-dedup")
                .help("Stop after the plan report; do not submit any dedup ioctls")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (repeatable)")
                .action(ArgAction::Count),
        )
}

/// Number of `-v` occurrences, for the caller to translate into a
/// `tracing` filter directive.
pub fn verbosity(matches: &ArgMatches) -> u8 {
    matches.get_count("verbose")
}

pub fn run_config_from_matches(matches: &ArgMatches) -> RunConfig {
    RunConfig {
        block_size: matches.get_one::<u64>("block-size").copied().unwrap_or(DEFAULT_BLOCK_SIZE),
        ref_limit: matches.get_one::<usize>("ref-limit").copied().unwrap_or(DEFAULT_REF_LIMIT),
        chunk_limit: matches.get_one::<u64>("temp-size").copied().unwrap_or(DEFAULT_CHUNK_LIMIT),
        chunk_file: matches.get_one::<PathBuf>("chunk-file").expect("required").clone(),
        hash_storage_prefix: matches.get_one::<PathBuf>("hash-file").expect("required").clone(),
        sort_mem_mib: matches.get_one::<u64>("sort-mem").copied().unwrap_or(DEFAULT_SORT_MEM_MIB),
        relocate_enabled: !matches.get_flag("no-relocate"),
        dedup_enabled: !matches.get_flag("no-dedup"),
    }
}

/// Reads a NUL-delimited list of paths from `reader`. A trailing fragment
/// that isn't itself terminated by a NUL is a usage error, not silently
/// accepted as one more entry.
pub fn read_nul_delimited_paths(mut reader: impl Read) -> Result<Vec<PathBuf>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    if *buf.last().unwrap() != 0 {
        return Err(Error::Cli(
            "file list on stdin must be NUL-terminated; trailing fragment is not".to_string(),
        ));
    }
    Ok(buf[..buf.len() - 1]
        .split(|&b| b == 0)
        .map(|chunk| PathBuf::from(String::from_utf8_lossy(chunk).into_owned()))
        .collect())
}

pub fn stdin_is_terminal() -> bool {
    io::stdin().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nul_delimited_list() {
        let input = b"a/b.txt\0c/d.txt\0".to_vec();
        let paths = read_nul_delimited_paths(&input[..]).unwrap();
        assert_eq!(paths, vec![PathBuf::from("a/b.txt"), PathBuf::from("c/d.txt")]);
    }

    #[test]
    fn empty_stdin_yields_empty_list() {
        let paths = read_nul_delimited_paths(&b""[..]).unwrap();
        assert!(paths.is_empty());
    }

    #[test]
    fn trailing_non_terminated_fragment_is_an_error() {
        let input = b"a/b.txt\0c/d.txt".to_vec();
        let err = read_nul_delimited_paths(&input[..]).unwrap_err();
        assert!(matches!(err, Error::Cli(_)));
    }

    #[test]
    fn defaults_apply_when_optional_flags_are_absent() {
        let matches = command()
            .try_get_matches_from(["blkdedup", "-s", "/tmp/h", "-c", "/tmp/c"])
            .unwrap();
        let config = run_config_from_matches(&matches);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.ref_limit, DEFAULT_REF_LIMIT);
        assert!(config.relocate_enabled);
        assert!(config.dedup_enabled);
    }

    #[test]
    fn no_relocate_and_no_dedup_flip_switches() {
        let matches = command()
            .try_get_matches_from([
                "blkdedup", "-s", "/tmp/h", "-c", "/tmp/c", "--no-relocate", "--no-dedup",
            ])
            .unwrap();
        let config = run_config_from_matches(&matches);
        assert!(!config.relocate_enabled);
        assert!(!config.dedup_enabled);
    }
}
