//! Runtime configuration read from the environment.
//!
//! The environment is read the first time the allocator is used, possibly
//! before anything else in the process could allocate, so lookups here go
//! straight to the platform and never allocate.

/// Environment variable controlling the exit-time report.
pub const VERBOSE_ENV: &str = "MALLOCVERBOSE";

/// Value of [`VERBOSE_ENV`] that turns the report off.
pub const VERBOSE_OFF: &str = "NO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Print heap size and call counters when the process exits.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { verbose: true }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            verbose: platform::read_verbose(),
        }
    }
}

/// Any value other than [`VERBOSE_OFF`], including none at all, enables the report.
fn verbose_from(value: Option<&[u8]>) -> bool {
    value != Some(VERBOSE_OFF.as_bytes())
}

#[cfg(unix)]
mod platform {
    use std::ffi::CStr;

    use super::verbose_from;

    pub(super) fn read_verbose() -> bool {
        // SAFETY: `getenv` returns null or a NUL-terminated string owned by
        // the environment.
        unsafe {
            let value = libc::getenv(c"MALLOCVERBOSE".as_ptr());

            verbose_from((!value.is_null()).then(|| CStr::from_ptr(value).to_bytes()))
        }
    }
}

#[cfg(windows)]
mod platform {
    use windows::{Win32::System::Environment::GetEnvironmentVariableA, core::s};

    use super::verbose_from;

    pub(super) fn read_verbose() -> bool {
        let mut buffer = [0u8; 16];

        // SAFETY: the buffer outlives the call and its length is passed along.
        let len = unsafe { GetEnvironmentVariableA(s!("MALLOCVERBOSE"), Some(&mut buffer)) } as usize;

        match len {
            0 => verbose_from(None),
            // Did not fit, so it can't be `NO` either.
            len if len > buffer.len() => true,
            len => verbose_from(Some(&buffer[..len])),
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    pub(super) fn read_verbose() -> bool {
        true
    }
}
