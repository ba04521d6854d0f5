//! Command-line construction for one Overviewer run.

use crate::error::RunError;
use crate::model::RunRequest;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Fully resolved invocation: program, arguments and the output directory to prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl RunCommand {
    /// Build the invocation for the current platform.
    pub fn from_request(req: &RunRequest) -> Result<Self, RunError> {
        Self::for_platform(req, cfg!(windows))
    }

    /// `windows` selects the `cmd /c` prefix so batch wrappers and PATH lookups behave
    /// the way they do in a console.
    pub fn for_platform(req: &RunRequest, windows: bool) -> Result<Self, RunError> {
        validate_map_name(&req.map)?;
        if req.executable.as_os_str().is_empty() {
            return Err(RunError::InvalidRequest(
                "no Overviewer executable configured".into(),
            ));
        }

        let input_dir = req.saves_root.join(&req.map);
        let output_dir = req.output_root.join(&req.map);

        let mut argv: Vec<OsString> = Vec::with_capacity(5);
        if windows {
            argv.push("cmd".into());
            argv.push("/c".into());
        }
        argv.push(req.executable.clone().into_os_string());
        argv.push(input_dir.clone().into_os_string());
        argv.push(output_dir.clone().into_os_string());

        let program = argv.remove(0);
        Ok(Self {
            program,
            args: argv,
            input_dir,
            output_dir,
        })
    }

    /// The full argument vector, program first.
    pub fn argv(&self) -> Vec<OsString> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Printable command line for logs and the UI.
    pub fn display(&self) -> String {
        self.argv()
            .iter()
            .map(|a| quote_arg(&a.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Map names come from directory listings, but a typed name must not escape the roots.
fn validate_map_name(map: &str) -> Result<(), RunError> {
    if map.trim().is_empty() {
        return Err(RunError::InvalidRequest("map name is empty".into()));
    }
    let path = Path::new(map);
    let single_component = path.components().count() == 1
        && matches!(
            path.components().next(),
            Some(std::path::Component::Normal(_))
        );
    if !single_component {
        return Err(RunError::InvalidRequest(format!(
            "map name must be a single folder name: {map}"
        )));
    }
    Ok(())
}

fn quote_arg(value: &str) -> String {
    if value.contains(' ') || value.contains('\t') {
        let escaped = value.replace('"', "\\\"");
        format!("\"{}\"", escaped)
    } else {
        value.to_string()
    }
}
