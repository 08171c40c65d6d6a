use nix::errno::Errno;
use std::{ffi::OsStr, path::PathBuf};
use tracing::error;

/// Name of this machine, used as default worker name and for node-local files
pub fn hostname() -> Result<String, Errno> {
    nix::unistd::gethostname().map(|hostname| hostname.to_string_lossy().into_owned())
}

/// turn `dir/records.db` into `dir/<hostname>_records.db`
pub fn prepend_hostname(input: &mut PathBuf) -> Result<(), Errno> {
    match nix::unistd::gethostname() {
        Ok(mut hostname) => {
            let file_name = input
                .file_name()
                .unwrap_or(OsStr::new("records.db"))
                .to_os_string();
            hostname.push("_");
            hostname.push(file_name);
            input.set_file_name(hostname);

            Ok(())
        }
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname for node-local database: {error}");

            Err(error)
        }
    }
}
