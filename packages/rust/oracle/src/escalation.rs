//! Two-model escalation wrapper.
//!
//! Every oracle question is asked of the primary model first. When the
//! caller's acceptance predicate rejects the answer (or the call itself
//! fails), the same question is retried once on the stronger secondary
//! model. The outcome records whether escalating changed anything, for
//! telemetry.

use carbonbom_shared::Result;
use tracing::{debug, warn};

use crate::{ChatMessage, ElicitRequest, Oracle, OracleReply};

/// What happened across the primary/secondary attempt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationOutcome {
    /// Model whose reply was returned.
    pub model_used: String,
    /// True when the secondary model was consulted.
    pub escalated: bool,
    /// True when the secondary's reply passed the predicate the primary's
    /// reply failed. Only meaningful when `escalated`.
    pub escalation_worked: bool,
}

/// Ask the primary model, escalating once to the secondary when `accept`
/// rejects the answer.
///
/// The secondary's reply is returned even when it is also rejected — the
/// caller owns the fallback policy (e.g. switching from exact lookup to
/// estimation).
pub async fn call_with_escalation<F>(
    oracle: &dyn Oracle,
    primary: &str,
    secondary: &str,
    messages: Vec<ChatMessage>,
    accept: F,
) -> Result<(OracleReply, EscalationOutcome)>
where
    F: Fn(&OracleReply) -> bool,
{
    let primary_attempt = oracle
        .elicit(ElicitRequest {
            model: primary.to_string(),
            messages: messages.clone(),
        })
        .await;

    match primary_attempt {
        Ok(reply) if accept(&reply) => {
            return Ok((
                reply,
                EscalationOutcome {
                    model_used: primary.to_string(),
                    escalated: false,
                    escalation_worked: false,
                },
            ));
        }
        Ok(_) => {
            debug!(primary, secondary, "answer rejected, escalating");
        }
        Err(e) => {
            warn!(primary, error = %e, "primary model call failed, escalating");
        }
    }

    let reply = oracle
        .elicit(ElicitRequest {
            model: secondary.to_string(),
            messages,
        })
        .await?;
    let escalation_worked = accept(&reply);

    Ok((
        reply,
        EscalationOutcome {
            model_used: secondary.to_string(),
            escalated: true,
            escalation_worked,
        },
    ))
}
