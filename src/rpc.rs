//! Remote evaluation of instance operations.
//!
//! Configured instances expose `start`, `run`, `log`, `ls` and `file` to
//! remote callers. Every call answers with a single-key JSON object:
//!
//! ```json
//! {"result": "..."}
//! {"error": "..."}
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::orchestrator::Orchestrator;
use crate::store::RemoteOperation;

/// Reply to a remote evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalReply {
    Result(String),
    Error(String),
}

impl EvalReply {
    pub fn result(&self) -> Option<&str> {
        match self {
            Self::Result(r) => Some(r),
            Self::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Result(_) => None,
            Self::Error(e) => Some(e),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Result(_))
    }
}

/// Request for a remote evaluation.
///
/// `arg` carries the environment string for `start`/`run` and the file
/// name for `file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalRequest {
    pub eval: RemoteOperation,
    pub instance: String,
    #[serde(default)]
    pub arg: String,
    /// Correlation id echoed back with the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Reply line paired with its request id.
#[derive(Debug, Clone, Serialize)]
pub struct EvalResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub reply: EvalReply,
}

impl Orchestrator {
    /// Runs one remote operation against an instance.
    pub async fn invoke(&self, op: RemoteOperation, instance: &str, arg: &str) -> EvalReply {
        debug!(instance = %instance, operation = %op, "remote evaluation");
        let outcome = match op {
            RemoteOperation::Start => self.start(instance, arg).await,
            RemoteOperation::Run => self.run(instance, arg).await,
            RemoteOperation::Log => self.log(instance).await,
            RemoteOperation::Ls => self.ls(instance).await,
            RemoteOperation::File => self.file(instance, arg).await,
        };
        match outcome {
            Ok(result) => EvalReply::Result(result),
            Err(e) => {
                warn!(instance = %instance, operation = %op, error = %e, "remote evaluation failed");
                EvalReply::Error(e.to_string())
            }
        }
    }

    /// Handles a decoded [`EvalRequest`].
    pub async fn evaluate(&self, request: &EvalRequest) -> EvalResponse {
        EvalResponse {
            id: request.id.clone(),
            reply: self.invoke(request.eval, &request.instance, &request.arg).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_wire_shape() {
        let ok = serde_json::to_value(EvalReply::Result("42".into())).unwrap();
        assert_eq!(ok, serde_json::json!({"result": "42"}));

        let err = serde_json::to_value(EvalReply::Error("boom".into())).unwrap();
        assert_eq!(err, serde_json::json!({"error": "boom"}));
    }

    #[test]
    fn test_request_defaults() {
        let req: EvalRequest = serde_json::from_str(r#"{"eval":"ls","instance":"i1"}"#).unwrap();
        assert_eq!(req.eval, RemoteOperation::Ls);
        assert_eq!(req.arg, "");
        assert!(req.id.is_none());
    }

    #[test]
    fn test_response_flattens_reply() {
        let resp = EvalResponse {
            id: Some("7".into()),
            reply: EvalReply::Error("nope".into()),
        };
        let json = serde_json::to_value(resp).unwrap();
        assert_eq!(json, serde_json::json!({"id": "7", "error": "nope"}));
    }
}
