//! The concrete consumer/provider handshake graphs.
//!
//! Both sides run the same eight states; the transitions differ because
//! the consumer verifies and the provider proves. Peer messages and local
//! follow-ups travel through the same machine as [`HandshakeEvent`]s, so
//! every protocol decision lives in one transition table per role.
//!
//! ```text
//! Start -> RatAwaitRequest -> RatAwaitResponse -> RatAwaitResult
//!       -> RatAwaitLeave -> MetaRequest -> MetaResponse -> End
//! ```
//!
//! An `Error` message from any non-terminal state fans out to `End`, as do
//! driver failures before a verdict; a failed verification after a completed
//! exchange still walks the normal path so both sides end with a recorded
//! verdict rather than a torn connection.

use idscp_proto::payloads::{MetaRequestData, MetaResponseData, RatResultData};
use idscp_proto::{Message, MessageType, Payload};
use idscp_rat::ControlMessage;

use crate::error::FsmConfigError;
use crate::fsm::{Fsm, FsmEvent, StateId};
use crate::session::{AttestationResult, Role, ConnectionAction, SessionContext};

/// Error code: no attestation mechanism acceptable to both sides.
pub const ERR_NO_MECHANISM: u32 = 1;
/// Error code: attestation driver failed or timed out.
pub const ERR_ATTESTATION: u32 = 2;
/// Error code: DAT acquisition or verification failed.
pub const ERR_TOKEN: u32 = 3;
/// Error code: metadata counter out of sequence.
pub const ERR_COUNTER: u32 = 4;
/// Error code: transport-level failure (decode error, channel closed).
pub const ERR_TRANSPORT: u32 = 5;

/// Discriminator for driver verdict events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKey {
    /// Prover driver reported success.
    ProverOk,
    /// Prover driver failed or timed out.
    ProverFailed,
    /// Verifier driver accepted the evidence.
    VerifierOk,
    /// Verifier driver rejected the evidence or timed out.
    VerifierFailed,
}

impl From<ControlMessage> for ControlKey {
    fn from(msg: ControlMessage) -> Self {
        match msg {
            ControlMessage::ProverOk => Self::ProverOk,
            ControlMessage::ProverFailed => Self::ProverFailed,
            ControlMessage::VerifierOk => Self::VerifierOk,
            ControlMessage::VerifierFailed => Self::VerifierFailed,
        }
    }
}

/// Transition lookup key: wire message type or driver verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// A protocol message, keyed by wire type.
    Message(MessageType),
    /// A driver verdict.
    Control(ControlKey),
}

/// One event fed through the handshake machine. Peer messages and locally
/// generated follow-ups use the same `Message` variant; the graph does not
/// distinguish them.
#[derive(Debug, Clone)]
pub enum HandshakeEvent {
    /// A protocol message, inbound or locally generated.
    Message(Message),
    /// A driver verdict.
    Control(ControlKey),
}

impl HandshakeEvent {
    /// Wrap a payload as a locally generated event. Local events carry
    /// message id zero; the send path assigns real ids.
    #[must_use]
    pub fn local(payload: Payload) -> Self {
        Self::Message(Message::new(0, payload))
    }
}

impl FsmEvent for HandshakeEvent {
    type Key = EventKey;

    fn key(&self) -> EventKey {
        match self {
            Self::Message(msg) => EventKey::Message(msg.message_type()),
            Self::Control(key) => EventKey::Control(*key),
        }
    }
}

/// State ids of one built handshake machine.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeStates {
    /// Before the handshake has started.
    pub start: StateId,
    /// Attestation announced, awaiting the verifier's request.
    pub rat_await_request: StateId,
    /// Request out, awaiting the prover's response.
    pub rat_await_response: StateId,
    /// Response delivered, awaiting the verifier's verdict.
    pub rat_await_result: StateId,
    /// Verdict out, awaiting the attestation close.
    pub rat_await_leave: StateId,
    /// Metadata request phase.
    pub meta_request: StateId,
    /// Metadata response phase (provider only has transitions here).
    pub meta_response: StateId,
    /// Terminal state; the verdict is final.
    pub end: StateId,
}

type HsFsm = Fsm<HandshakeEvent, SessionContext>;

fn payload_of(event: &HandshakeEvent) -> Option<&Payload> {
    match event {
        HandshakeEvent::Message(msg) => Some(&msg.payload),
        HandshakeEvent::Control(_) => None,
    }
}

/// Acquire our DAT and send the metadata request. Runs on the consumer
/// when the attestation phase closes.
fn send_meta_request(ctx: &mut SessionContext) -> bool {
    let dat = match ctx.daps().get_token() {
        Ok(dat) => dat,
        Err(err) => {
            ctx.fail_session(ERR_TOKEN, format!("token acquisition failed: {err}"));
            return false;
        },
    };
    let request = MetaRequestData {
        session_id: 1,
        dat,
        requirements: ctx.config.requirements.required,
    };
    ctx.set_expected_counter(request.session_id + 1);
    ctx.push_send(Payload::MetaRequest(request));
    true
}

/// Validate an inbound metadata request and stage our response. Runs on
/// the provider.
fn handle_meta_request(event: &HandshakeEvent, ctx: &mut SessionContext) -> bool {
    let Some(Payload::MetaRequest(data)) = payload_of(event) else {
        return false;
    };
    if data.session_id != ctx.expected_counter() {
        ctx.reply_error(
            ERR_COUNTER,
            format!("metadata counter {} out of sequence, expected {}", data.session_id, ctx.expected_counter()),
        );
        return false;
    }
    match ctx.daps().verify_token(&data.dat, &ctx.config.requirements) {
        Ok(validity) if validity > 0 => {},
        Ok(_) => {
            ctx.fail_session(ERR_TOKEN, "peer token rejected");
            return false;
        },
        Err(err) => {
            ctx.fail_session(ERR_TOKEN, format!("peer token verification failed: {err}"));
            return false;
        },
    }
    let dat = match ctx.daps().get_token() {
        Ok(dat) => dat,
        Err(err) => {
            ctx.fail_session(ERR_TOKEN, format!("token acquisition failed: {err}"));
            return false;
        },
    };
    let response = MetaResponseData {
        session_id: data.session_id + 1,
        dat,
        self_description: ctx.config.self_description.clone(),
    };
    ctx.enqueue_local(HandshakeEvent::local(Payload::MetaResponse(response)));
    true
}

/// Build the handshake machine for one role. The machine is freshly built
/// per connection; the table is immutable afterwards.
pub fn build_fsm(role: Role) -> Result<(HsFsm, HandshakeStates), FsmConfigError> {
    let mut fsm = HsFsm::new();
    let states = HandshakeStates {
        start: fsm.add_state("start", "handshake not started")?,
        rat_await_request: fsm.add_state("rat_await_request", "awaiting attestation request")?,
        rat_await_response: fsm.add_state("rat_await_response", "awaiting attestation response")?,
        rat_await_result: fsm.add_state("rat_await_result", "awaiting attestation verdict")?,
        rat_await_leave: fsm.add_state("rat_await_leave", "awaiting attestation close")?,
        meta_request: fsm.add_state("meta_request", "metadata request phase")?,
        meta_response: fsm.add_state("meta_response", "metadata response phase")?,
        end: fsm.add_state("end", "handshake complete")?,
    };

    match role {
        Role::Consumer => build_consumer(&mut fsm, states)?,
        Role::Provider => build_provider(&mut fsm, states)?,
    }
    add_error_fanout(&mut fsm, states)?;

    fsm.on_entry(
        states.end,
        Box::new(|ctx| {
            ctx.record_verdict(AttestationResult::Skipped);
            tracing::info!(
                role = ctx.role().as_str(),
                verdict = ?ctx.verdict(),
                "handshake complete"
            );
        }),
    )?;

    Ok((fsm, states))
}

fn build_consumer(fsm: &mut HsFsm, s: HandshakeStates) -> Result<(), FsmConfigError> {
    // Local kick-off: announce attestation and start our verifier. With no
    // expected mechanisms the attestation phase is skipped entirely and the
    // session jumps to the metadata exchange.
    fsm.add_transition(
        s.start,
        EventKey::Message(MessageType::RatStart),
        s.rat_await_request,
        Box::new(|_event, ctx| {
            ctx.push_send(Payload::RatStart);
            match ctx.config.expected_mechanisms.first().cloned() {
                Some(mechanism) => {
                    ctx.active_mechanism = Some(mechanism.clone());
                    ctx.push_action(ConnectionAction::StartVerifier(mechanism));
                },
                None => {
                    tracing::info!("no expected mechanisms, skipping attestation");
                    ctx.enqueue_local(HandshakeEvent::local(Payload::RatLeave));
                },
            }
            true
        }),
    )?;

    // Verifier driver produced a challenge; forward it to the prover.
    let forward_request: fn(&HandshakeEvent, &mut SessionContext) -> bool = |event, ctx| {
        let Some(payload) = payload_of(event) else {
            return false;
        };
        ctx.push_send(payload.clone());
        true
    };
    fsm.add_transition(
        s.rat_await_request,
        EventKey::Message(MessageType::RatRequest),
        s.rat_await_response,
        Box::new(forward_request),
    )?;
    // Multi-round mechanisms loop back for another challenge.
    fsm.add_transition(
        s.rat_await_result,
        EventKey::Message(MessageType::RatRequest),
        s.rat_await_response,
        Box::new(forward_request),
    )?;

    // Skip path: no attestation configured.
    fsm.add_transition(
        s.rat_await_request,
        EventKey::Message(MessageType::RatLeave),
        s.meta_request,
        Box::new(|_event, ctx| send_meta_request(ctx)),
    )?;

    // Prover's evidence goes to our verifier driver.
    fsm.add_transition(
        s.rat_await_response,
        EventKey::Message(MessageType::RatResponse),
        s.rat_await_result,
        Box::new(|event, ctx| {
            let Some(Payload::RatResponse(data)) = payload_of(event) else {
                return false;
            };
            ctx.push_action(ConnectionAction::DelegateToVerifier(data.payload.clone()));
            true
        }),
    )?;

    // Verifier verdict. Either way the exchange completes; the verdict is
    // recorded, not enforced.
    fsm.add_transition(
        s.rat_await_result,
        EventKey::Control(ControlKey::VerifierOk),
        s.rat_await_leave,
        Box::new(|_event, ctx| {
            ctx.record_verdict(AttestationResult::Success);
            ctx.push_send(Payload::RatResult(RatResultData {
                success: true,
                report: "attestation evidence accepted".to_owned(),
            }));
            true
        }),
    )?;
    fsm.add_transition(
        s.rat_await_result,
        EventKey::Control(ControlKey::VerifierFailed),
        s.rat_await_leave,
        Box::new(|_event, ctx| {
            ctx.record_verdict(AttestationResult::Failed);
            ctx.push_send(Payload::RatResult(RatResultData {
                success: false,
                report: "attestation evidence rejected".to_owned(),
            }));
            true
        }),
    )?;

    // A verifier failure before any evidence arrived (driver error or
    // timeout) terminates the handshake.
    for state in [s.rat_await_request, s.rat_await_response] {
        fsm.add_transition(
            state,
            EventKey::Control(ControlKey::VerifierFailed),
            s.end,
            Box::new(|_event, ctx| {
                ctx.record_verdict(AttestationResult::Failed);
                ctx.reply_error(ERR_ATTESTATION, "attestation verifier failed");
                ctx.push_action(ConnectionAction::Close {
                    reason: "attestation verifier failed".to_owned(),
                });
                true
            }),
        )?;
    }

    // Attestation closed by the peer; open the metadata exchange.
    fsm.add_transition(
        s.rat_await_leave,
        EventKey::Message(MessageType::RatLeave),
        s.meta_request,
        Box::new(|_event, ctx| send_meta_request(ctx)),
    )?;

    // Peer's metadata response closes the handshake, provided the counter
    // matches and its token verifies.
    fsm.add_transition(
        s.meta_request,
        EventKey::Message(MessageType::MetaResponse),
        s.end,
        Box::new(|event, ctx| {
            let Some(Payload::MetaResponse(data)) = payload_of(event) else {
                return false;
            };
            if data.session_id != ctx.expected_counter() {
                ctx.reply_error(
                    ERR_COUNTER,
                    format!(
                        "metadata counter {} out of sequence, expected {}",
                        data.session_id,
                        ctx.expected_counter()
                    ),
                );
                return false;
            }
            match ctx.daps().verify_token(&data.dat, &ctx.config.requirements) {
                Ok(validity) if validity > 0 => {},
                Ok(_) => {
                    ctx.fail_session(ERR_TOKEN, "peer token rejected");
                    return false;
                },
                Err(err) => {
                    ctx.fail_session(ERR_TOKEN, format!("peer token verification failed: {err}"));
                    return false;
                },
            }
            ctx.set_peer_description(data.self_description.clone());
            true
        }),
    )?;

    Ok(())
}

fn build_provider(fsm: &mut HsFsm, s: HandshakeStates) -> Result<(), FsmConfigError> {
    // Peer announced attestation.
    fsm.add_transition(
        s.start,
        EventKey::Message(MessageType::RatStart),
        s.rat_await_request,
        Box::new(|_event, _ctx| {
            tracing::debug!("peer opened attestation");
            true
        }),
    )?;

    // Verifier's challenge: settle on a mechanism, start our prover, and
    // hand it the nonce.
    fsm.add_transition(
        s.rat_await_request,
        EventKey::Message(MessageType::RatRequest),
        s.rat_await_response,
        Box::new(|event, ctx| {
            let Some(Payload::RatRequest(data)) = payload_of(event) else {
                return false;
            };
            let Some(mechanism) = data
                .mechanisms
                .iter()
                .find(|m| ctx.config.supported_mechanisms.contains(m))
                .cloned()
            else {
                ctx.fail_session(ERR_NO_MECHANISM, "no common attestation mechanism");
                return false;
            };
            ctx.active_mechanism = Some(mechanism.clone());
            ctx.push_action(ConnectionAction::StartProver(mechanism));
            ctx.push_action(ConnectionAction::DelegateToProver(data.nonce.clone()));
            true
        }),
    )?;

    // Skip path: the peer went straight to metadata without attesting us.
    fsm.add_transition(
        s.rat_await_request,
        EventKey::Message(MessageType::MetaRequest),
        s.meta_response,
        Box::new(handle_meta_request),
    )?;

    // Our prover produced evidence; send it.
    fsm.add_transition(
        s.rat_await_response,
        EventKey::Message(MessageType::RatResponse),
        s.rat_await_result,
        Box::new(|event, ctx| {
            let Some(payload) = payload_of(event) else {
                return false;
            };
            ctx.push_send(payload.clone());
            true
        }),
    )?;

    // Multi-round mechanisms: another challenge for the running prover.
    fsm.add_transition(
        s.rat_await_result,
        EventKey::Message(MessageType::RatRequest),
        s.rat_await_response,
        Box::new(|event, ctx| {
            let Some(Payload::RatRequest(data)) = payload_of(event) else {
                return false;
            };
            ctx.push_action(ConnectionAction::DelegateToProver(data.nonce.clone()));
            true
        }),
    )?;

    // Verifier's verdict on our evidence; close the attestation phase.
    fsm.add_transition(
        s.rat_await_result,
        EventKey::Message(MessageType::RatResult),
        s.rat_await_leave,
        Box::new(|event, ctx| {
            let Some(Payload::RatResult(data)) = payload_of(event) else {
                return false;
            };
            let verdict = if data.success {
                AttestationResult::Success
            } else {
                AttestationResult::Failed
            };
            ctx.record_verdict(verdict);
            ctx.enqueue_local(HandshakeEvent::local(Payload::RatLeave));
            true
        }),
    )?;

    fsm.add_transition(
        s.rat_await_leave,
        EventKey::Message(MessageType::RatLeave),
        s.meta_request,
        Box::new(|_event, ctx| {
            ctx.push_send(Payload::RatLeave);
            true
        }),
    )?;

    fsm.add_transition(
        s.meta_request,
        EventKey::Message(MessageType::MetaRequest),
        s.meta_response,
        Box::new(handle_meta_request),
    )?;

    // Staged response goes out; the handshake is complete.
    fsm.add_transition(
        s.meta_response,
        EventKey::Message(MessageType::MetaResponse),
        s.end,
        Box::new(|event, ctx| {
            let Some(payload) = payload_of(event) else {
                return false;
            };
            ctx.push_send(payload.clone());
            true
        }),
    )?;

    // A prover failure (driver error or timeout) terminates the handshake.
    for state in [s.rat_await_request, s.rat_await_response, s.rat_await_result] {
        fsm.add_transition(
            state,
            EventKey::Control(ControlKey::ProverFailed),
            s.end,
            Box::new(|_event, ctx| {
                ctx.record_verdict(AttestationResult::Failed);
                ctx.reply_error(ERR_ATTESTATION, "attestation prover failed");
                ctx.push_action(ConnectionAction::Close {
                    reason: "attestation prover failed".to_owned(),
                });
                true
            }),
        )?;
    }

    Ok(())
}

/// An `Error` message, inbound or locally generated, terminates the
/// handshake from every non-terminal state without an outbound reply.
fn add_error_fanout(fsm: &mut HsFsm, s: HandshakeStates) -> Result<(), FsmConfigError> {
    for state in [
        s.start,
        s.rat_await_request,
        s.rat_await_response,
        s.rat_await_result,
        s.rat_await_leave,
        s.meta_request,
        s.meta_response,
    ] {
        let left = fsm.state_name(state).to_owned();
        fsm.add_transition(
            state,
            EventKey::Message(MessageType::Error),
            s.end,
            Box::new(move |event, ctx| {
                let reason = if let Some(Payload::Error(data)) = payload_of(event) {
                    tracing::warn!(
                        state = %left,
                        role = ctx.role().as_str(),
                        code = data.code,
                        message = %data.message,
                        "handshake terminated by error"
                    );
                    data.message.clone()
                } else {
                    tracing::warn!(
                        state = %left,
                        role = ctx.role().as_str(),
                        "handshake terminated by error"
                    );
                    "handshake error".to_owned()
                };
                ctx.record_verdict(AttestationResult::Failed);
                ctx.push_action(ConnectionAction::Close { reason });
                true
            }),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use idscp_proto::payloads::{ErrorData, RatRequestData, RatResponseData};

    use super::*;
    use crate::daps::StaticDaps;
    use crate::fsm::FeedOutcome;
    use crate::session::ConnectionConfig;

    fn consumer() -> (HsFsm, HandshakeStates, SessionContext) {
        let (mut fsm, states) = build_fsm(Role::Consumer).unwrap();
        let mut ctx = SessionContext::new(
            Role::Consumer,
            ConnectionConfig::default(),
            Arc::new(StaticDaps::accepting()),
        );
        fsm.set_initial_state(&mut ctx, states.start).unwrap();
        (fsm, states, ctx)
    }

    fn provider() -> (HsFsm, HandshakeStates, SessionContext) {
        let (mut fsm, states) = build_fsm(Role::Provider).unwrap();
        let mut ctx = SessionContext::new(
            Role::Provider,
            ConnectionConfig::default(),
            Arc::new(StaticDaps::accepting()),
        );
        fsm.set_initial_state(&mut ctx, states.start).unwrap();
        (fsm, states, ctx)
    }

    fn feed(fsm: &mut HsFsm, ctx: &mut SessionContext, payload: Payload) -> FeedOutcome {
        fsm.feed_event(ctx, &HandshakeEvent::local(payload))
    }

    #[test]
    fn consumer_walks_the_happy_path() {
        let (mut fsm, states, mut ctx) = consumer();

        assert_eq!(
            feed(&mut fsm, &mut ctx, Payload::RatStart),
            FeedOutcome::Transitioned(states.rat_await_request)
        );
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::RatRequest(RatRequestData {
                    mechanisms: vec!["dummy".to_owned()],
                    nonce: b"challenge".to_vec(),
                })
            ),
            FeedOutcome::Transitioned(states.rat_await_response)
        );
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::RatResponse(RatResponseData {
                    mechanism: "dummy".to_owned(),
                    payload: b"evidence".to_vec(),
                })
            ),
            FeedOutcome::Transitioned(states.rat_await_result)
        );
        assert_eq!(
            fsm.feed_event(&mut ctx, &HandshakeEvent::Control(ControlKey::VerifierOk)),
            FeedOutcome::Transitioned(states.rat_await_leave)
        );
        assert_eq!(
            feed(&mut fsm, &mut ctx, Payload::RatLeave),
            FeedOutcome::Transitioned(states.meta_request)
        );
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::MetaResponse(MetaResponseData {
                    session_id: 2,
                    dat: b"token".to_vec(),
                    self_description: "peer".to_owned(),
                })
            ),
            FeedOutcome::Transitioned(states.end)
        );
        assert_eq!(ctx.verdict(), Some(AttestationResult::Success));
        assert_eq!(ctx.peer_description(), Some("peer"));
    }

    #[test]
    fn provider_walks_the_happy_path() {
        let (mut fsm, states, mut ctx) = provider();

        assert_eq!(
            feed(&mut fsm, &mut ctx, Payload::RatStart),
            FeedOutcome::Transitioned(states.rat_await_request)
        );
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::RatRequest(RatRequestData {
                    mechanisms: vec!["dummy".to_owned()],
                    nonce: b"challenge".to_vec(),
                })
            ),
            FeedOutcome::Transitioned(states.rat_await_response)
        );
        assert_eq!(ctx.active_mechanism.as_deref(), Some("dummy"));
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::RatResponse(RatResponseData {
                    mechanism: "dummy".to_owned(),
                    payload: b"evidence".to_vec(),
                })
            ),
            FeedOutcome::Transitioned(states.rat_await_result)
        );
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::RatResult(RatResultData { success: true, report: String::new() })
            ),
            FeedOutcome::Transitioned(states.rat_await_leave)
        );
        // The RatResult handler stages a local RatLeave.
        let leave = ctx.pop_local_event().unwrap();
        assert_eq!(
            fsm.feed_event(&mut ctx, &leave),
            FeedOutcome::Transitioned(states.meta_request)
        );
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::MetaRequest(MetaRequestData {
                    session_id: 1,
                    dat: b"token".to_vec(),
                    requirements: Default::default(),
                })
            ),
            FeedOutcome::Transitioned(states.meta_response)
        );
        // The staged response carries the incremented counter.
        let response = ctx.pop_local_event().unwrap();
        let HandshakeEvent::Message(msg) = &response else {
            panic!("expected staged message");
        };
        let Payload::MetaResponse(data) = &msg.payload else {
            panic!("expected meta response");
        };
        assert_eq!(data.session_id, 2);
        assert_eq!(
            fsm.feed_event(&mut ctx, &response),
            FeedOutcome::Transitioned(states.end)
        );
        assert_eq!(ctx.verdict(), Some(AttestationResult::Success));
    }

    #[test]
    fn failed_attestation_still_completes() {
        let (mut fsm, states, mut ctx) = consumer();
        feed(&mut fsm, &mut ctx, Payload::RatStart);
        feed(
            &mut fsm,
            &mut ctx,
            Payload::RatRequest(RatRequestData { mechanisms: vec![], nonce: vec![] }),
        );
        feed(
            &mut fsm,
            &mut ctx,
            Payload::RatResponse(RatResponseData {
                mechanism: "dummy".to_owned(),
                payload: vec![],
            }),
        );
        assert_eq!(
            fsm.feed_event(&mut ctx, &HandshakeEvent::Control(ControlKey::VerifierFailed)),
            FeedOutcome::Transitioned(states.rat_await_leave)
        );
        assert_eq!(ctx.verdict(), Some(AttestationResult::Failed));
        // RatResult(false) was sent, not an error.
        let sent: Vec<MessageType> = ctx
            .drain_actions()
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::SendMessage(m) => Some(m.message_type()),
                _ => None,
            })
            .collect();
        assert!(sent.contains(&MessageType::RatResult));
        feed(&mut fsm, &mut ctx, Payload::RatLeave);
        feed(
            &mut fsm,
            &mut ctx,
            Payload::MetaResponse(MetaResponseData {
                session_id: 2,
                dat: b"token".to_vec(),
                self_description: String::new(),
            }),
        );
        assert_eq!(fsm.current_state(), Some(states.end));
        assert_eq!(ctx.verdict(), Some(AttestationResult::Failed));
    }

    #[test]
    fn error_fans_out_from_every_non_terminal_state() {
        for role in [Role::Consumer, Role::Provider] {
            let (_, states) = build_fsm(role).unwrap();
            let non_terminal = [
                states.start,
                states.rat_await_request,
                states.rat_await_response,
                states.rat_await_result,
                states.rat_await_leave,
                states.meta_request,
                states.meta_response,
            ];
            for state in non_terminal {
                // A fresh machine can be initialized into any state.
                let (mut fsm, s) = build_fsm(role).unwrap();
                let mut ctx = SessionContext::new(
                    role,
                    ConnectionConfig::default(),
                    Arc::new(StaticDaps::accepting()),
                );
                fsm.set_initial_state(&mut ctx, state).unwrap();
                assert_eq!(
                    feed(
                        &mut fsm,
                        &mut ctx,
                        Payload::Error(ErrorData { code: ERR_TRANSPORT, message: String::new() })
                    ),
                    FeedOutcome::Transitioned(s.end),
                    "{role:?} state {} must fan out to end",
                    fsm.state_name(state)
                );
                assert_eq!(ctx.verdict(), Some(AttestationResult::Failed));
            }
        }
    }

    #[test]
    fn error_fanout_logs_the_departed_state() {
        use std::sync::Mutex;

        use tracing::field::{Field, Visit};

        // Captures the `state` field of every emitted event.
        struct StateCapture {
            states: Arc<Mutex<Vec<String>>>,
        }

        impl tracing::Subscriber for StateCapture {
            fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
                true
            }

            fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
                tracing::span::Id::from_u64(1)
            }

            fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}

            fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}

            fn event(&self, event: &tracing::Event<'_>) {
                struct StateVisitor<'a>(&'a mut Vec<String>);

                impl Visit for StateVisitor<'_> {
                    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
                        if field.name() == "state" {
                            self.0.push(format!("{value:?}"));
                        }
                    }
                }

                let mut states = self.states.lock().unwrap();
                event.record(&mut StateVisitor(&mut *states));
            }

            fn enter(&self, _: &tracing::span::Id) {}

            fn exit(&self, _: &tracing::span::Id) {}
        }

        let states = Arc::new(Mutex::new(Vec::new()));
        let subscriber = StateCapture { states: Arc::clone(&states) };

        tracing::subscriber::with_default(subscriber, || {
            let (mut fsm, s) = build_fsm(Role::Consumer).unwrap();
            let mut ctx = SessionContext::new(
                Role::Consumer,
                ConnectionConfig::default(),
                Arc::new(StaticDaps::accepting()),
            );
            fsm.set_initial_state(&mut ctx, s.meta_request).unwrap();
            feed(
                &mut fsm,
                &mut ctx,
                Payload::Error(ErrorData { code: ERR_TRANSPORT, message: "boom".to_owned() }),
            );
        });

        let seen = states.lock().unwrap();
        assert!(
            seen.iter().any(|state| state == "meta_request"),
            "termination log must name the departed state, got {seen:?}"
        );
    }

    #[test]
    fn error_message_terminates_with_failed_verdict() {
        let (mut fsm, states, mut ctx) = consumer();
        feed(&mut fsm, &mut ctx, Payload::RatStart);
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::Error(ErrorData { code: ERR_TRANSPORT, message: "boom".to_owned() })
            ),
            FeedOutcome::Transitioned(states.end)
        );
        assert_eq!(ctx.verdict(), Some(AttestationResult::Failed));
    }

    #[test]
    fn counter_mismatch_replies_error_and_holds_state() {
        let (mut fsm, states, mut ctx) = consumer();
        feed(&mut fsm, &mut ctx, Payload::RatStart);
        feed(
            &mut fsm,
            &mut ctx,
            Payload::RatRequest(RatRequestData { mechanisms: vec![], nonce: vec![] }),
        );
        feed(
            &mut fsm,
            &mut ctx,
            Payload::RatResponse(RatResponseData {
                mechanism: "dummy".to_owned(),
                payload: vec![],
            }),
        );
        fsm.feed_event(&mut ctx, &HandshakeEvent::Control(ControlKey::VerifierOk));
        feed(&mut fsm, &mut ctx, Payload::RatLeave);
        ctx.drain_actions();

        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::MetaResponse(MetaResponseData {
                    session_id: 7,
                    dat: b"token".to_vec(),
                    self_description: String::new(),
                })
            ),
            FeedOutcome::ActionFailed
        );
        assert_eq!(fsm.current_state(), Some(states.meta_request));
        let actions = ctx.drain_actions();
        assert!(matches!(
            &actions[..],
            [ConnectionAction::SendMessage(m)] if m.message_type() == MessageType::Error
        ));
        // No local error was staged; the session is still live.
        assert!(ctx.pop_local_event().is_none());
    }

    #[test]
    fn rejected_token_fails_the_session() {
        let (mut fsm, states) = build_fsm(Role::Consumer).unwrap();
        let mut ctx = SessionContext::new(
            Role::Consumer,
            ConnectionConfig::default(),
            Arc::new(StaticDaps::rejecting()),
        );
        fsm.set_initial_state(&mut ctx, states.start).unwrap();
        feed(&mut fsm, &mut ctx, Payload::RatStart);
        feed(
            &mut fsm,
            &mut ctx,
            Payload::RatRequest(RatRequestData { mechanisms: vec![], nonce: vec![] }),
        );
        feed(
            &mut fsm,
            &mut ctx,
            Payload::RatResponse(RatResponseData {
                mechanism: "dummy".to_owned(),
                payload: vec![],
            }),
        );
        fsm.feed_event(&mut ctx, &HandshakeEvent::Control(ControlKey::VerifierOk));
        feed(&mut fsm, &mut ctx, Payload::RatLeave);

        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::MetaResponse(MetaResponseData {
                    session_id: 2,
                    dat: b"bad".to_vec(),
                    self_description: String::new(),
                })
            ),
            FeedOutcome::ActionFailed
        );
        // fail_session staged a local error event; feeding it terminates.
        let error = ctx.pop_local_event().unwrap();
        assert_eq!(fsm.feed_event(&mut ctx, &error), FeedOutcome::Transitioned(states.end));
        // Verdict was Success from the attestation; it is not overwritten.
        assert_eq!(ctx.verdict(), Some(AttestationResult::Success));
    }

    #[test]
    fn no_common_mechanism_fails_the_provider_session() {
        let (mut fsm, states, mut ctx) = provider();
        feed(&mut fsm, &mut ctx, Payload::RatStart);
        assert_eq!(
            feed(
                &mut fsm,
                &mut ctx,
                Payload::RatRequest(RatRequestData {
                    mechanisms: vec!["tpm2.0".to_owned()],
                    nonce: vec![],
                })
            ),
            FeedOutcome::ActionFailed
        );
        let error = ctx.pop_local_event().unwrap();
        assert_eq!(fsm.feed_event(&mut ctx, &error), FeedOutcome::Transitioned(states.end));
        assert_eq!(ctx.verdict(), Some(AttestationResult::Failed));
    }

    #[test]
    fn unexpected_message_is_ignored() {
        let (mut fsm, states, mut ctx) = consumer();
        feed(&mut fsm, &mut ctx, Payload::RatStart);
        assert_eq!(
            feed(&mut fsm, &mut ctx, Payload::RatLeave),
            FeedOutcome::Transitioned(states.meta_request)
        );
        // Start over with a duplicate RatStart mid-exchange: no transition.
        assert_eq!(feed(&mut fsm, &mut ctx, Payload::RatStart), FeedOutcome::Rejected);
    }

    #[test]
    fn skip_path_records_skipped_verdict() {
        let (mut fsm, states) = build_fsm(Role::Consumer).unwrap();
        let config = ConnectionConfig { expected_mechanisms: vec![], ..Default::default() };
        let mut ctx =
            SessionContext::new(Role::Consumer, config, Arc::new(StaticDaps::accepting()));
        fsm.set_initial_state(&mut ctx, states.start).unwrap();

        feed(&mut fsm, &mut ctx, Payload::RatStart);
        // The kick-off staged a local RatLeave instead of starting a driver.
        let leave = ctx.pop_local_event().unwrap();
        assert_eq!(
            fsm.feed_event(&mut ctx, &leave),
            FeedOutcome::Transitioned(states.meta_request)
        );
        feed(
            &mut fsm,
            &mut ctx,
            Payload::MetaResponse(MetaResponseData {
                session_id: 2,
                dat: b"token".to_vec(),
                self_description: String::new(),
            }),
        );
        assert_eq!(fsm.current_state(), Some(states.end));
        assert_eq!(ctx.verdict(), Some(AttestationResult::Skipped));
    }
}
