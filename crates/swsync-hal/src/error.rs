//! HAL status codes and error type.

use std::fmt;
use thiserror::Error;

/// Status codes returned by a forwarding-plane driver.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalStatus {
    Success = 0,
    Failure = -1,
    NotSupported = -2,
    NoMemory = -3,
    InsufficientResources = -4,
    InvalidParameter = -5,
    ItemAlreadyExists = -6,
    ItemNotFound = -7,
    TableFull = -8,
    ObjectInUse = -9,
    Uninitialized = -10,
    /// Driver connection lost; nothing more can be programmed until reset.
    Unavailable = -11,
}

impl HalStatus {
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => HalStatus::Success,
            -2 => HalStatus::NotSupported,
            -3 => HalStatus::NoMemory,
            -4 => HalStatus::InsufficientResources,
            -5 => HalStatus::InvalidParameter,
            -6 => HalStatus::ItemAlreadyExists,
            -7 => HalStatus::ItemNotFound,
            -8 => HalStatus::TableFull,
            -9 => HalStatus::ObjectInUse,
            -10 => HalStatus::Uninitialized,
            -11 => HalStatus::Unavailable,
            _ => HalStatus::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == HalStatus::Success
    }

    pub fn into_result(self) -> HalResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(HalError::from_status(self))
        }
    }
}

impl fmt::Display for HalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HalStatus::Success => "HAL_STATUS_SUCCESS",
            HalStatus::Failure => "HAL_STATUS_FAILURE",
            HalStatus::NotSupported => "HAL_STATUS_NOT_SUPPORTED",
            HalStatus::NoMemory => "HAL_STATUS_NO_MEMORY",
            HalStatus::InsufficientResources => "HAL_STATUS_INSUFFICIENT_RESOURCES",
            HalStatus::InvalidParameter => "HAL_STATUS_INVALID_PARAMETER",
            HalStatus::ItemAlreadyExists => "HAL_STATUS_ITEM_ALREADY_EXISTS",
            HalStatus::ItemNotFound => "HAL_STATUS_ITEM_NOT_FOUND",
            HalStatus::TableFull => "HAL_STATUS_TABLE_FULL",
            HalStatus::ObjectInUse => "HAL_STATUS_OBJECT_IN_USE",
            HalStatus::Uninitialized => "HAL_STATUS_UNINITIALIZED",
            HalStatus::Unavailable => "HAL_STATUS_UNAVAILABLE",
        };
        write!(f, "{}", s)
    }
}

/// Error type for forwarding-plane operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("HAL operation failed: {status}")]
    Status { status: HalStatus },

    #[error("Feature not supported: {feature}")]
    NotSupported { feature: String },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Item not found: {item}")]
    NotFound { item: String },

    #[error("Item already exists: {item}")]
    AlreadyExists { item: String },

    #[error("Table full: {table}")]
    TableFull { table: String },

    /// The driver is gone. Callers must stop programming and reset.
    #[error("Forwarding plane unavailable")]
    Unavailable,
}

impl HalError {
    pub fn from_status(status: HalStatus) -> Self {
        match status {
            HalStatus::NotSupported => HalError::not_supported("unknown"),
            HalStatus::InvalidParameter => HalError::InvalidParameter {
                message: format!("driver returned {}", status),
            },
            HalStatus::ItemNotFound => HalError::not_found("unknown"),
            HalStatus::ItemAlreadyExists => HalError::already_exists("unknown"),
            HalStatus::TableFull => HalError::table_full("unknown"),
            HalStatus::Unavailable | HalStatus::Uninitialized => HalError::Unavailable,
            _ => HalError::Status { status },
        }
    }

    pub fn not_supported(feature: impl Into<String>) -> Self {
        HalError::NotSupported {
            feature: feature.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        HalError::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn not_found(item: impl Into<String>) -> Self {
        HalError::NotFound { item: item.into() }
    }

    pub fn already_exists(item: impl Into<String>) -> Self {
        HalError::AlreadyExists { item: item.into() }
    }

    pub fn table_full(table: impl Into<String>) -> Self {
        HalError::TableFull {
            table: table.into(),
        }
    }

    pub fn status(&self) -> Option<HalStatus> {
        match self {
            HalError::Status { status } => Some(*status),
            _ => None,
        }
    }

    /// True when the error means the whole forwarding plane is gone rather
    /// than one call having failed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HalError::Unavailable)
    }
}

pub type HalResult<T> = Result<T, HalError>;

/// Converts raw driver return codes.
pub trait HalStatusExt {
    fn to_result(self) -> HalResult<()>;
}

impl HalStatusExt for i32 {
    fn to_result(self) -> HalResult<()> {
        HalStatus::from_raw(self).into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_from_raw() {
        assert_eq!(HalStatus::from_raw(0), HalStatus::Success);
        assert_eq!(HalStatus::from_raw(-7), HalStatus::ItemNotFound);
        assert_eq!(HalStatus::from_raw(-999), HalStatus::Failure);
    }

    #[test]
    fn test_error_from_status() {
        assert!(matches!(
            HalError::from_status(HalStatus::TableFull),
            HalError::TableFull { .. }
        ));
        assert_eq!(HalError::from_status(HalStatus::Uninitialized), HalError::Unavailable);
        assert_eq!(
            HalError::from_status(HalStatus::NoMemory).status(),
            Some(HalStatus::NoMemory)
        );
    }

    #[test]
    fn test_only_unavailable_is_fatal() {
        assert!(HalError::Unavailable.is_fatal());
        assert!(!HalError::table_full("egress").is_fatal());
        assert!((-11_i32).to_result().unwrap_err().is_fatal());
        assert!(0_i32.to_result().is_ok());
    }
}
