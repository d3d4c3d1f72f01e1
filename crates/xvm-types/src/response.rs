use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

pub const STATUS_OK: i32 = 200;
/// Statuses at or above this value are contract-level errors.
pub const STATUS_ERROR_THRESHOLD: i32 = 400;
pub const STATUS_ERROR: i32 = 500;

/// Output of a contract method, set through the `SetOutput` syscall.
#[derive(
    Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct Response {
    pub status: i32,
    pub message: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: STATUS_OK,
            message: String::new(),
            body: body.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            message: message.into(),
            body: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status >= STATUS_ERROR_THRESHOLD
    }
}

/// Event emitted by a contract during a call.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct ContractEvent {
    pub contract: String,
    pub name: String,
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_threshold() {
        assert!(!Response::ok(b"x".to_vec()).is_error());
        assert!(Response::error("boom").is_error());

        let not_found = Response {
            status: 404,
            message: "missing".into(),
            body: vec![],
        };
        assert!(not_found.is_error());

        let redirect = Response {
            status: 399,
            ..Default::default()
        };
        assert!(!redirect.is_error());
    }

    #[test]
    fn test_response_borsh_layout() {
        let resp = Response {
            status: 200,
            message: "ok".into(),
            body: vec![7],
        };
        let bytes = borsh::to_vec(&resp).unwrap();
        // i32 status, u32-prefixed message, u32-prefixed body
        assert_eq!(bytes, vec![200, 0, 0, 0, 2, 0, 0, 0, b'o', b'k', 1, 0, 0, 0, 7]);
    }
}
