//! Stable status codes returned across the runtime boundary.
use std::fmt;

/// Outcome of a runtime operation. `Success` is zero; everything else is a
/// stable negative code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    GenericError = -1,
    OutOfMemory = -2,
    DeviceError = -3,
    BadFingerprint = -4,
    NotFound = -5,
    InvalidArgument = -6,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Status::Success => "success",
            Status::GenericError => "generic error",
            Status::OutOfMemory => "out of device memory",
            Status::DeviceError => "device error",
            Status::BadFingerprint => "module fingerprint mismatch",
            Status::NotFound => "not found",
            Status::InvalidArgument => "invalid argument",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Result type of the runtime surface: a value or a stable status code.
pub type DeviceResult<T> = std::result::Result<T, Status>;

/// Collapse a payload-free result into its status code.
pub fn code_of<T>(result: &DeviceResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(status) => status.code(),
    }
}
