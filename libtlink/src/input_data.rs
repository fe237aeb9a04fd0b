//! Reads our input files into memory. Files are read in full up front; no handles survive past
//! this phase.

use crate::args::Args;
use crate::error::Context as _;
use crate::error::Result;
use std::fmt::Display;
use std::path::PathBuf;

/// Identifies an input file by its position on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FileId(u32);

impl FileId {
    pub(crate) fn new(raw: u32) -> FileId {
        FileId(raw)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct InputFile {
    pub(crate) file_id: FileId,
    pub(crate) path: PathBuf,
    pub(crate) text: String,
}

pub(crate) struct InputData {
    pub(crate) files: Vec<InputFile>,
}

impl InputData {
    #[tracing::instrument(skip_all, name = "Read input files")]
    pub(crate) fn from_args(args: &Args) -> Result<InputData> {
        let files = args
            .inputs
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read input file `{}`", path.display()))?;
                Ok(InputFile {
                    file_id: FileId::new(i as u32),
                    path: path.clone(),
                    text,
                })
            })
            .collect::<Result<Vec<InputFile>>>()?;
        Ok(InputData { files })
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}
