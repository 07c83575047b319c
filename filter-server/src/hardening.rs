//! Restricts the process to what it needs once startup is done: the standard
//! streams, plus whatever the greylist store is reached through.
//!
//! Only OpenBSD offers the primitives (`pledge(2)`, `unveil(2)`); elsewhere
//! [`restrict`] logs that nothing was done.

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// What the store needs from the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    StdioOnly,
    Network,
    Socket(Utf8PathBuf),
}

impl Access {
    pub fn promises(&self) -> &'static str {
        match self {
            Access::StdioOnly => "stdio",
            Access::Network => "stdio inet dns",
            Access::Socket(_) => "stdio unix",
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[cfg_attr(not(target_os = "openbsd"), allow(dead_code))]
pub enum HardeningError {
    #[error("pledge({promises:?}) failed")]
    #[diagnostic(code(qdgrey::hardening::pledge))]
    Pledge {
        promises: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unveil({path:?}) failed")]
    #[diagnostic(code(qdgrey::hardening::unveil))]
    Unveil {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path contains a NUL byte")]
    #[diagnostic(code(qdgrey::hardening::nul))]
    Nul(#[from] std::ffi::NulError),
}

#[cfg(target_os = "openbsd")]
pub fn restrict(access: &Access) -> Result<(), HardeningError> {
    use std::{ffi::CString, io, ptr};

    if let Access::Socket(path) = access {
        let c_path = CString::new(path.as_str())?;
        let permissions = CString::new("rw")?;
        if unsafe { libc::unveil(c_path.as_ptr(), permissions.as_ptr()) } == -1 {
            return Err(HardeningError::Unveil {
                path: path.to_string(),
                source: io::Error::last_os_error(),
            });
        }
    }

    // Lock the unveil list; nothing else on the filesystem is visible now.
    if unsafe { libc::unveil(ptr::null(), ptr::null()) } == -1 {
        return Err(HardeningError::Unveil {
            path: String::new(),
            source: io::Error::last_os_error(),
        });
    }

    let promises = access.promises();
    let c_promises = CString::new(promises)?;
    if unsafe { libc::pledge(c_promises.as_ptr(), ptr::null()) } == -1 {
        return Err(HardeningError::Pledge {
            promises,
            source: io::Error::last_os_error(),
        });
    }

    tracing::info!(promises, "Restricted process privileges");
    Ok(())
}

#[cfg(not(target_os = "openbsd"))]
pub fn restrict(access: &Access) -> Result<(), HardeningError> {
    tracing::debug!(
        promises = access.promises(),
        "Privilege restriction is not available on this platform"
    );
    Ok(())
}
