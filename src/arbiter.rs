//! Tool-Call Arbiter: pack-tool execution rendezvous, user-question
//! rendezvous, and tool-approval relay.
//!
//! Grounded on the `PendingInvoke` pattern (a map from opaque id to a
//! one-shot channel the responder delivers into at most once).

use crate::connection::AgentConnection;
use crate::error::{GatewayError, GatewayResult};
use crate::wire::{PackToolOutcome, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, serde::Serialize)]
pub struct QuestionAnswer {
    pub answered: bool,
    pub selected: Vec<String>,
    pub custom_text: String,
    pub reason: String,
}

struct PendingQuestion {
    agent_id: String,
    answer_tx: oneshot::Sender<QuestionAnswer>,
}

/// `options.len() ≥ 1` and every label unique (spec invariant on `ask_user`).
pub fn validate_options(options: &[String]) -> GatewayResult<()> {
    if options.is_empty() {
        return Err(GatewayError::InvalidArgument(
            "ask_user requires at least one option".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::with_capacity(options.len());
    if !options.iter().all(|label| seen.insert(label)) {
        return Err(GatewayError::InvalidArgument(
            "ask_user option labels must be unique".to_string(),
        ));
    }
    Ok(())
}

pub struct ArbiterConfig {
    pub pack_tool_default_timeout: Duration,
    pub pack_tool_max_timeout: Duration,
    pub question_default_timeout: Duration,
    pub question_min_timeout: Duration,
    pub question_max_timeout: Duration,
}

pub struct Arbiter {
    pending_pack_calls: RwLock<HashMap<String, oneshot::Sender<PackToolOutcome>>>,
    pending_questions: RwLock<HashMap<String, PendingQuestion>>,
    config: ArbiterConfig,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            pending_pack_calls: RwLock::new(HashMap::new()),
            pending_questions: RwLock::new(HashMap::new()),
            config,
        }
    }

    // ==================== Pack-tool execution ====================

    /// Dispatches `tool_name(input_json)` on `pack_connection` and blocks
    /// until the pack answers or the (clamped) timeout elapses. A timed-out
    /// call resolves to an error outcome rather than propagating a transport
    /// error, so the caller can still relay `pack_tool_result` to the agent.
    pub async fn dispatch_pack_tool(
        &self,
        pack_connection: &Arc<AgentConnection>,
        tool_name: &str,
        input_json: &str,
        requested_timeout: Option<Duration>,
    ) -> GatewayResult<PackToolOutcome> {
        let timeout = requested_timeout
            .unwrap_or(self.config.pack_tool_default_timeout)
            .min(self.config.pack_tool_max_timeout);

        let request_id = format!("pack-{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.pending_pack_calls
            .write()
            .await
            .insert(request_id.clone(), tx);

        if let Err(e) = pack_connection.send_server_message(ServerMessage::InvokePackTool {
            request_id: request_id.clone(),
            tool_name: tool_name.to_string(),
            input_json: input_json.to_string(),
        }) {
            self.pending_pack_calls.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Ok(PackToolOutcome::Error {
                error: "pack connection dropped before responding".to_string(),
            }),
            Err(_) => {
                self.pending_pack_calls.write().await.remove(&request_id);
                Ok(PackToolOutcome::Error {
                    error: "pack tool call timed out".to_string(),
                })
            }
        }
    }

    /// Called by the websocket handler when a pack connection delivers a
    /// `PackToolOutcome` envelope. Returns false if the request id is
    /// unknown (already timed out or never registered).
    pub async fn deliver_pack_tool_outcome(&self, request_id: &str, outcome: PackToolOutcome) -> bool {
        let tx = self.pending_pack_calls.write().await.remove(request_id);
        match tx {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    // ==================== User questions ====================

    /// Registers a pending question and waits for an answer or timeout.
    /// `requested_timeout_seconds` is clamped to the configured [min, max].
    /// Validates `options` before registering anything (`options.len() ≥ 1`,
    /// labels unique); `question`/`multi_select`/`header` are carried only to
    /// let the caller build the `user_question` envelope pushed to
    /// subscribed chat sessions; the Arbiter itself only needs the answer.
    #[allow(clippy::too_many_arguments)]
    pub async fn ask_user(
        &self,
        agent_id: &str,
        question_id: &str,
        _question: String,
        options: Vec<String>,
        _multi_select: bool,
        _header: Option<String>,
        requested_timeout_seconds: Option<u64>,
    ) -> GatewayResult<QuestionAnswer> {
        validate_options(&options)?;

        let timeout = requested_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.question_default_timeout)
            .clamp(self.config.question_min_timeout, self.config.question_max_timeout);

        let (tx, rx) = oneshot::channel();
        self.pending_questions.write().await.insert(
            question_id.to_string(),
            PendingQuestion {
                agent_id: agent_id.to_string(),
                answer_tx: tx,
            },
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => {
                self.pending_questions.write().await.remove(question_id);
                Ok(QuestionAnswer {
                    answered: false,
                    selected: vec![],
                    custom_text: String::new(),
                    reason: "no_response".to_string(),
                })
            }
            Err(_) => {
                self.pending_questions.write().await.remove(question_id);
                Ok(QuestionAnswer {
                    answered: false,
                    selected: vec![],
                    custom_text: String::new(),
                    reason: "timeout".to_string(),
                })
            }
        }
    }

    /// Delivers an answer to a pending question. Fails with `NotFound` if
    /// the question was never registered, already answered, or already
    /// timed out; fails with `InvalidArgument` if `agent_id` doesn't match
    /// the agent the question was registered against.
    pub async fn answer_question(
        &self,
        agent_id: &str,
        question_id: &str,
        selected: Vec<String>,
        custom_text: Option<String>,
    ) -> GatewayResult<()> {
        let pending = self.pending_questions.write().await.remove(question_id);
        let Some(pending) = pending else {
            return Err(GatewayError::NotFound(format!("question {question_id}")));
        };
        if pending.agent_id != agent_id {
            // Put it back; this caller wasn't the right one to resolve it.
            self.pending_questions
                .write()
                .await
                .insert(question_id.to_string(), pending);
            return Err(GatewayError::InvalidArgument(
                "question does not belong to this agent".to_string(),
            ));
        }
        let _ = pending.answer_tx.send(QuestionAnswer {
            answered: true,
            selected,
            custom_text: custom_text.unwrap_or_default(),
            reason: String::new(),
        });
        Ok(())
    }

    // ==================== Tool approval relay ====================

    pub fn relay_tool_approval(
        &self,
        agent_connection: &Arc<AgentConnection>,
        tool_id: &str,
        approved: bool,
        approve_all: bool,
    ) -> GatewayResult<()> {
        agent_connection.send_server_message(ServerMessage::ToolApprovalResponse {
            tool_id: tool_id.to_string(),
            approved,
            approve_all,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ServerMessage;
    use tokio::sync::mpsc;

    fn config() -> ArbiterConfig {
        ArbiterConfig {
            pack_tool_default_timeout: Duration::from_millis(200),
            pack_tool_max_timeout: Duration::from_secs(1),
            question_default_timeout: Duration::from_millis(200),
            question_min_timeout: Duration::from_millis(10),
            question_max_timeout: Duration::from_secs(1),
        }
    }

    fn make_connection() -> (Arc<AgentConnection>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(AgentConnection::new(
            "c1".into(),
            "inst-1".into(),
            "pack-1".into(),
            crate::model::PrincipalKind::Pack,
            "Pack".into(),
            vec![],
            vec![],
            "/w".into(),
            None,
            tx,
        ));
        (conn, rx)
    }

    #[tokio::test]
    async fn pack_tool_round_trip() {
        let arbiter = Arc::new(Arbiter::new(config()));
        let (conn, mut outbound) = make_connection();

        let arbiter_clone = arbiter.clone();
        let handle = tokio::spawn(async move {
            arbiter_clone
                .dispatch_pack_tool(&conn, "search", "{}", None)
                .await
        });

        let request_id = match outbound.recv().await.unwrap() {
            ServerMessage::InvokePackTool { request_id, .. } => request_id,
            _ => panic!("expected invoke"),
        };

        arbiter
            .deliver_pack_tool_outcome(
                &request_id,
                PackToolOutcome::Output {
                    output_json: "{\"ok\":true}".into(),
                },
            )
            .await;

        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, PackToolOutcome::Output { .. }));
    }

    #[tokio::test]
    async fn pack_tool_timeout_yields_error_outcome() {
        let arbiter = Arbiter::new(config());
        let (conn, _outbound) = make_connection();
        let outcome = arbiter
            .dispatch_pack_tool(&conn, "search", "{}", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(matches!(outcome, PackToolOutcome::Error { .. }));
    }

    fn yes_no() -> Vec<String> {
        vec!["yes".to_string(), "no".to_string()]
    }

    #[tokio::test]
    async fn question_answered_before_timeout() {
        let arbiter = Arc::new(Arbiter::new(config()));
        let arbiter_clone = arbiter.clone();
        let handle = tokio::spawn(async move {
            arbiter_clone
                .ask_user("agent-a", "q1", "Proceed?".into(), yes_no(), false, None, Some(1))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        arbiter
            .answer_question("agent-a", "q1", vec!["yes".into()], None)
            .await
            .unwrap();
        let answer = handle.await.unwrap().unwrap();
        assert!(answer.answered);
        assert_eq!(answer.selected, vec!["yes".to_string()]);
    }

    #[tokio::test]
    async fn question_wrong_agent_rejected() {
        let arbiter = Arc::new(Arbiter::new(config()));
        let arbiter_clone = arbiter.clone();
        let handle = tokio::spawn(async move {
            arbiter_clone
                .ask_user("agent-a", "q1", "Proceed?".into(), yes_no(), false, None, Some(1))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = arbiter
            .answer_question("agent-b", "q1", vec!["yes".into()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
        handle.abort();
    }

    #[tokio::test]
    async fn question_timeout_reports_reason() {
        let arbiter = Arbiter::new(config());
        let answer = arbiter
            .ask_user("agent-a", "q1", "Proceed?".into(), yes_no(), false, None, Some(0))
            .await
            .unwrap();
        assert!(!answer.answered);
        assert_eq!(answer.reason, "timeout");
    }

    #[tokio::test]
    async fn empty_options_rejected() {
        let arbiter = Arbiter::new(config());
        let err = arbiter
            .ask_user("agent-a", "q1", "Proceed?".into(), vec![], false, None, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn duplicate_option_labels_rejected() {
        let arbiter = Arbiter::new(config());
        let err = arbiter
            .ask_user(
                "agent-a",
                "q1",
                "Proceed?".into(),
                vec!["yes".into(), "yes".into()],
                false,
                None,
                Some(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArgument(_)));
    }
}
