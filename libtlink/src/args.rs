//! Command-line handling. The interface is strictly positional: one or more input object files
//! followed by the output path.

use crate::error::Result;
use anyhow::bail;
use std::path::PathBuf;

pub struct Args {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
}

const USAGE: &str = "usage: tlink <input object>... <output>";

impl Args {
    pub fn from_env() -> Result<Args> {
        Args::parse(std::env::args().skip(1))
    }

    fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Args> {
        let mut paths: Vec<PathBuf> = args.into_iter().map(PathBuf::from).collect();
        if paths.len() < 2 {
            bail!("expected at least one input object file and an output path\n{USAGE}");
        }
        let output = paths.pop().unwrap();
        Ok(Args {
            inputs: paths,
            output,
        })
    }
}

#[test]
fn test_parse_args() {
    let args = Args::parse(["a.lk".to_owned(), "b.lk".to_owned(), "out.lk".to_owned()]).unwrap();
    assert_eq!(args.inputs.len(), 2);
    assert_eq!(args.output, PathBuf::from("out.lk"));
}

#[test]
fn test_too_few_args() {
    assert!(Args::parse(["only-one.lk".to_owned()]).is_err());
    assert!(Args::parse([]).is_err());
}
