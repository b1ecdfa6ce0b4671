use std::path::Path;

use anyhow::Result;

use crate::errors::InputError;

const REPORT_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// The run-report encoding is picked by file extension; an extensionless
/// path is written as JSON. Anything else is rejected before the run starts
/// so a finished run never fails at the write.
pub(crate) fn check_report_path(path: Option<&Path>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let Some(extension) = path.extension() else {
        return Ok(());
    };
    let extension = extension.to_str().ok_or_else(|| InputError::NonUTF8Path {
        path: path.to_path_buf(),
    })?;
    if REPORT_EXTENSIONS.contains(&extension) {
        return Ok(());
    }
    Err(InputError::InvalidFileExtension {
        extension: extension.to_owned(),
        supported: REPORT_EXTENSIONS.join(","),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn known_report_encodings_pass() {
        for name in ["run.json", "run.yaml", "run.yml", "run"] {
            let path = PathBuf::from(name);
            assert!(check_report_path(Some(&path)).is_ok(), "{name}");
        }
    }

    #[test]
    fn unknown_extension_is_rejected_up_front() {
        let path = PathBuf::from("run.xml");
        let error = check_report_path(Some(&path)).unwrap_err();
        assert!(format!("{error}").contains("xml"));
    }

    #[test]
    fn no_report_requested_is_fine() {
        assert!(check_report_path(None).is_ok());
    }
}
