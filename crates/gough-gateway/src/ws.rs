//! Browser terminal bridge.
//!
//! `GET /ws/shell?session_id=…&token=…` upgrades to a WebSocket and bridges
//! the browser to the target agent by speaking SSH on the caller's behalf:
//! the gateway mints an ephemeral keypair, has the CA certify it for the
//! session's principals, and connects to the agent's reverse-SSH server.
//!
//! Frames are JSON text messages:
//!
//! - `{"type": "input", "data": "<base64>"}`: keystrokes to the PTY
//! - `{"type": "output", "data": "<base64>"}`: PTY output
//! - `{"type": "resize", "cols": 120, "rows": 40}`: window change
//!
//! Ordering is strict FIFO per session. Bytes pass through opaquely
//! (base64-wrapped), so UTF-8 sequences split across reads survive; the
//! terminal emulator decodes. Frames over 1 MiB are rejected without
//! terminating the session. Output is chunked at 64 KiB.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use base64::Engine;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, Certificate, PrivateKey};

use gough_ca::generate_key_id;
use gough_control::tokens::TokenKind;
use gough_control::Subject;
use gough_core::SessionId;
use gough_store::Store;

use crate::error::ApiError;
use crate::state::GatewayState;

const MAX_FRAME_BYTES: usize = 1024 * 1024;
const OUTPUT_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub(crate) struct ShellWsQuery {
    session_id: SessionId,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Input { data: String },
    Resize { cols: u32, rows: u32 },
}

/// WebSocket upgrade handler for the browser terminal.
///
/// # Errors
///
/// Rejects before upgrade when the token is invalid, the session is not
/// the caller's, or the session is closed or expired.
pub async fn shell_ws<S: Store + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState<S>>>,
    Query(query): Query<ShellWsQuery>,
) -> Result<Response, ApiError> {
    // Browsers cannot set Authorization on WebSocket requests; the access
    // token rides in the query string.
    let claims = state.tokens.verify(&query.token, TokenKind::Access)?;
    let Subject::User(user_id) = Subject::parse(&claims.sub)? else {
        return Err(ApiError::Unauthorized("not a user token".into()));
    };

    let session = state
        .store
        .get_session(&query.session_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("session {}", query.session_id)))?;

    if session.user_id != user_id {
        return Err(ApiError::Forbidden);
    }
    if session.ended_at.is_some() || session.expires_at <= Utc::now() {
        return Err(ApiError::Conflict("session is not live".into()));
    }

    let agent = state
        .store
        .get_agent(&session.agent_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::AgentUnavailable("agent record missing".into()))?;

    let user = state
        .store
        .get_user(&user_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::Unauthorized("account missing".into()))?;

    // Principals come from the session's assignment, like the native SSH
    // path.
    let assignment = state
        .store
        .get_assignment(&session.team_id, &session.resource_type, &session.resource_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let principals: Vec<String> = match assignment {
        Some(a) if !a.shell_principals.is_empty() => a.shell_principals,
        _ => vec!["ubuntu".to_string()],
    };
    let username = principals[0].clone();

    // Ephemeral key for this bridge connection only; never persisted.
    let private_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let public_openssh = private_key
        .public_key()
        .to_openssh()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    #[allow(clippy::cast_sign_loss)]
    let remaining_s = (session.expires_at - Utc::now()).num_seconds().max(60) as u64;
    let key_id = generate_key_id(&user.email, &session.resource_id, Utc::now());
    let cert_text = state
        .ca
        .sign_session(
            &public_openssh,
            &principals,
            remaining_s,
            &key_id,
            Some(&session.session_id.to_string()),
        )
        .await
        .map_err(gough_control::ControlError::from)?;
    let certificate = Certificate::from_openssh(&cert_text)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let host = agent.public_ip.clone();
    let port = agent.rssh_port;
    let session_id = session.session_id;
    let metrics = Arc::clone(&state.metrics);

    Ok(ws.on_upgrade(move |socket| async move {
        metrics.sessions_live.inc();
        if let Err(e) = bridge(socket, &host, port, &username, private_key, certificate).await {
            tracing::warn!(session_id = %session_id, error = %e, "terminal bridge ended with error");
        }
        metrics.sessions_live.dec();
        tracing::info!(session_id = %session_id, "terminal bridge closed");
    }))
}

struct AcceptingClient;

impl russh::client::Handler for AcceptingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Trust is established by the certificate the agent validates, not
        // by the agent's host key; the bridge connects to addresses the
        // control plane recorded at enrollment.
        Ok(true)
    }
}

async fn bridge(
    socket: WebSocket,
    host: &str,
    port: u16,
    username: &str,
    private_key: PrivateKey,
    certificate: Certificate,
) -> anyhow::Result<()> {
    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect(config, (host, port), AcceptingClient).await?;

    let auth = handle
        .authenticate_openssh_cert(username, Arc::new(private_key), certificate)
        .await?;
    if !matches!(auth, russh::client::AuthResult::Success) {
        anyhow::bail!("agent rejected the certificate");
    }

    let mut channel = handle.channel_open_session().await?;
    channel
        .request_pty(false, "xterm-256color", 80, 24, 0, 0, &[])
        .await?;
    channel.request_shell(false).await?;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            ws_msg = ws_receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_FRAME_BYTES {
                            // Oversized frames are dropped, not fatal.
                            send_error(&mut ws_sender, "frame too large").await;
                            continue;
                        }
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Input { data }) => {
                                let Ok(bytes) =
                                    base64::engine::general_purpose::STANDARD.decode(&data)
                                else {
                                    send_error(&mut ws_sender, "invalid input encoding").await;
                                    continue;
                                };
                                channel.data(&bytes[..]).await?;
                            }
                            Ok(ClientFrame::Resize { cols, rows }) => {
                                channel.window_change(cols, rows, 0, 0).await?;
                            }
                            Err(_) => {
                                send_error(&mut ws_sender, "unrecognized frame").await;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        send_error(&mut ws_sender, "binary frames are not accepted").await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        channel.close().await.ok();
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket read error");
                        channel.close().await.ok();
                        break;
                    }
                }
            }
            ssh_msg = channel.wait() => {
                match ssh_msg {
                    Some(russh::ChannelMsg::Data { data }) => {
                        send_output(&mut ws_sender, &data).await?;
                    }
                    Some(russh::ChannelMsg::ExtendedData { data, .. }) => {
                        send_output(&mut ws_sender, &data).await?;
                    }
                    Some(russh::ChannelMsg::ExitStatus { .. })
                    | Some(russh::ChannelMsg::Eof)
                    | Some(russh::ChannelMsg::Close)
                    | None => {
                        use futures::SinkExt;
                        ws_sender.send(Message::Close(None)).await.ok();
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    Ok(())
}

async fn send_output(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    data: &[u8],
) -> anyhow::Result<()> {
    use futures::SinkExt;
    // Chunked so a single burst never exceeds the frame budget.
    for chunk in data.chunks(OUTPUT_CHUNK_BYTES) {
        let frame = serde_json::json!({
            "type": "output",
            "data": base64::engine::general_purpose::STANDARD.encode(chunk),
        });
        sender.send(Message::Text(frame.to_string().into())).await?;
    }
    Ok(())
}

async fn send_error(sender: &mut futures::stream::SplitSink<WebSocket, Message>, message: &str) {
    use futures::SinkExt;
    let frame = serde_json::json!({"type": "error", "message": message});
    sender
        .send(Message::Text(frame.to_string().into()))
        .await
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let input: ClientFrame =
            serde_json::from_str(r#"{"type":"input","data":"bHMK"}"#).unwrap();
        assert!(matches!(input, ClientFrame::Input { .. }));

        let resize: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        match resize {
            ClientFrame::Resize { cols, rows } => {
                assert_eq!(cols, 120);
                assert_eq!(rows, 40);
            }
            ClientFrame::Input { .. } => panic!("wrong variant"),
        }
    }
}
