//! A hand-written parser for our arguments. We take exactly three positional
//! paths and no flags, so a 3rd party library would be more code than doing
//! it by hand.

use crate::error::Result;
use anyhow::bail;
use std::path::PathBuf;

pub const VALIDATE_ENV: &str = "POSTLINKER_VALIDATE_OUTPUT";

pub const USAGE: &str = "Usage: postlinker <EXEC> <REL> <OUTPUT>";

pub struct Args {
    /// The fully linked ET_EXEC executable whose entry point we redirect.
    pub exec: PathBuf,

    /// The ET_REL object whose allocatable sections get embedded.
    pub rel: PathBuf,

    /// Where to write the combined executable.
    pub output: PathBuf,

    /// Re-parse the output after writing it and check our layout invariants.
    /// Always on in debug builds.
    pub validate_output: bool,
}

impl Args {
    pub fn from_env() -> Result<Args> {
        Args::parse(std::env::args().skip(1))
    }

    /// Parses the supplied arguments, which should not include the program
    /// name.
    pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Args> {
        let mut positional = Vec::new();
        for arg in input {
            let arg = arg.as_ref();
            if arg.starts_with('-') {
                bail!("Unrecognised argument `{arg}`\n{USAGE}");
            }
            positional.push(PathBuf::from(arg));
        }
        let [exec, rel, output] = <[PathBuf; 3]>::try_from(positional)
            .map_err(|_| anyhow::anyhow!("Expected exactly three arguments\n{USAGE}"))?;
        Ok(Args {
            exec,
            rel,
            output,
            validate_output: std::env::var(VALIDATE_ENV).is_ok_and(|v| v == "1"),
        })
    }
}

#[test]
fn test_parse_positional() {
    let args = Args::parse(["a", "b", "c"].into_iter()).unwrap();
    assert_eq!(args.exec, PathBuf::from("a"));
    assert_eq!(args.rel, PathBuf::from("b"));
    assert_eq!(args.output, PathBuf::from("c"));
}

#[test]
fn test_parse_wrong_arity() {
    assert!(Args::parse(["a", "b"].into_iter()).is_err());
    assert!(Args::parse(["a", "b", "c", "d"].into_iter()).is_err());
}

#[test]
fn test_parse_rejects_flags() {
    assert!(Args::parse(["--help", "b", "c"].into_iter()).is_err());
}
