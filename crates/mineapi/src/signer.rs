use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;

use crate::{ApiError, ApiErrorKind};

#[derive(Clone, Debug)]
pub struct SignedMessage {
    pub signature: String,
    pub pubkey: String,
}

/// Wallet signing is delegated to an external tool; the coordinator
/// never touches key material.
#[allow(async_fn_in_trait)]
pub trait Signer: Send + Sync {
    async fn sign(&self, address: &str, message: &str) -> Result<SignedMessage, ApiError>;
}

#[derive(Debug, Deserialize)]
struct SignerOutput {
    success: bool,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    pubkey: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_signer_output(stdout: &str) -> Result<SignedMessage, ApiError> {
    let output: SignerOutput = serde_json::from_str(stdout.trim())
        .map_err(|err| ApiError::new(ApiErrorKind::Codec, format!("signer output: {err}")))?;
    if !output.success {
        return Err(ApiError::new(
            ApiErrorKind::Http,
            output
                .message
                .unwrap_or_else(|| "signer reported failure".to_string()),
        ));
    }
    match (output.signature, output.pubkey) {
        (Some(signature), Some(pubkey)) => Ok(SignedMessage { signature, pubkey }),
        _ => Err(ApiError::new(
            ApiErrorKind::Codec,
            "signer output missing signature or pubkey",
        )),
    }
}

/// Invokes the configured signing binary with the same stdout-JSON
/// contract as the miner: one object `{success, signature?, pubkey?,
/// message?}`.
pub struct CommandSigner {
    binary: PathBuf,
}

impl CommandSigner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Signer for CommandSigner {
    async fn sign(&self, address: &str, message: &str) -> Result<SignedMessage, ApiError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--address")
            .arg(address)
            .arg("--message")
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| {
                ApiError::new(
                    ApiErrorKind::Http,
                    format!("failed to run signer {}: {err}", self.binary.display()),
                )
            })?;
        if !output.status.success() {
            return Err(ApiError::new(
                ApiErrorKind::Http,
                format!(
                    "signer exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        parse_signer_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_successful_output() {
        let signed = parse_signer_output(
            r#"{"success": true, "signature": "84582aa2", "pubkey": "a42006"}"#,
        )
        .expect("parse");
        assert_eq!(signed.signature, "84582aa2");
        assert_eq!(signed.pubkey, "a42006");
    }

    #[test]
    fn failure_carries_the_tool_message() {
        let err = parse_signer_output(r#"{"success": false, "message": "unknown address"}"#)
            .expect_err("failure");
        assert_eq!(err.message, "unknown address");
    }

    #[test]
    fn missing_fields_are_a_codec_error() {
        let err = parse_signer_output(r#"{"success": true}"#).expect_err("incomplete");
        assert_eq!(err.kind, ApiErrorKind::Codec);
    }
}
