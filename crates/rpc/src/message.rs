//! Wire envelopes for CRM servers: borsh-encoded, length-delimited.

use borsh::{BorshDeserialize, BorshSerialize};
use noodle_primitives::{NoodleError, Result};

#[derive(BorshDeserialize, BorshSerialize, Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Ping,
    Call { method: String, payload: Vec<u8> },
    Shutdown,
}

#[derive(BorshDeserialize, BorshSerialize, Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Pong,
    Ok(Vec<u8>),
    Err(String),
    ShuttingDown,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        borsh::to_vec(self).map_err(|err| NoodleError::Transport(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::try_from_slice(bytes)
            .map_err(|err| NoodleError::Transport(format!("malformed request frame: {err}")))
    }
}

impl Reply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        borsh::to_vec(self).map_err(|err| NoodleError::Transport(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::try_from_slice(bytes)
            .map_err(|err| NoodleError::Transport(format!("malformed reply frame: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_round_trip() {
        let request = Request::Call {
            method: "add_name".to_owned(),
            payload: b"\"Alice\"".to_vec(),
        };
        let decoded = Request::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);

        let reply = Reply::Ok(b"[]".to_vec());
        assert_eq!(Reply::decode(&reply.encode().unwrap()).unwrap(), reply);
    }

    #[test]
    fn garbage_frames_are_transport_errors() {
        assert!(Request::decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
