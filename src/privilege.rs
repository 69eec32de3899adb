//! Elevated-rights detection and elevated relaunch.
//!
//! The pipeline itself never relaunches; it only reports that elevation is
//! missing. The binary's entry point calls [`relaunch_elevated`] once and exits.

use crate::error::{Error, Result};

/// Marker passed to the elevated child so it never tries to relaunch again
pub const RELAUNCH_MARKER: &str = "--relaunched";

/// Check whether the current process runs with administrative rights
#[cfg(windows)]
pub fn is_elevated() -> bool {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

    unsafe {
        let mut token: HANDLE = std::ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut returned = 0u32;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut TOKEN_ELEVATION as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        );
        CloseHandle(token);

        ok != 0 && elevation.TokenIsElevated != 0
    }
}

#[cfg(unix)]
pub fn is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(any(windows, unix)))]
pub fn is_elevated() -> bool {
    false
}

/// Start the current executable again through the UAC `runas` verb
///
/// Returns once the elevated process has been requested; the caller is
/// expected to exit right after.
#[cfg(windows)]
pub fn relaunch_elevated(args: &[String]) -> Result<()> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::shellapi::ShellExecuteW;
    use winapi::um::winuser::SW_SHOWNORMAL;

    fn to_wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(std::iter::once(0)).collect()
    }

    let exe = std::env::current_exe()?;
    let verb = to_wide(OsStr::new("runas"));
    let file = to_wide(exe.as_os_str());
    let parameters = to_wide(OsStr::new(&relaunch_parameters(args)));

    let result = unsafe {
        ShellExecuteW(
            std::ptr::null_mut(),
            verb.as_ptr(),
            file.as_ptr(),
            parameters.as_ptr(),
            std::ptr::null(),
            SW_SHOWNORMAL,
        )
    };

    // Values above 32 mean the elevated process was started
    let code = result as isize;
    if code > 32 {
        Ok(())
    } else {
        Err(Error::Elevation(format!(
            "elevation request was refused or failed (ShellExecute code {})",
            code
        )))
    }
}

#[cfg(not(windows))]
pub fn relaunch_elevated(_args: &[String]) -> Result<()> {
    Err(Error::Elevation(
        "automatic elevation is only available on Windows; re-run as root".to_string(),
    ))
}

/// Command line for the elevated child: the original arguments plus the marker
pub fn relaunch_parameters(args: &[String]) -> String {
    args.iter()
        .filter(|arg| arg.as_str() != RELAUNCH_MARKER)
        .map(|arg| quote_argument(arg))
        .chain(std::iter::once(RELAUNCH_MARKER.to_string()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote one argument following the Windows command-line parsing rules
fn quote_argument(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}
