async fn stream_session(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_socket(socket, state))
}

async fn stream_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before greeting so nothing addressed to this socket is missed.
    let mut rx = state.deliveries.subscribe();
    let greeting = state.session.lock().await.connection_greeting();
    for event in &greeting {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    let mut participant_id: Option<String> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_inbound(&state, &mut participant_id, text.as_str()).await;
                        if let Some(reply) = reply {
                            if send_event(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Ok(delivery) => {
                        if !is_deliverable(&delivery, participant_id.as_deref()) {
                            continue;
                        }

                        if send_event(&mut socket, &delivery.event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, participant_id = ?participant_id, "stream client lagged");
                        let warning = OutboundEvent::Error(ApiError::new(
                            ErrorCode::InternalError,
                            format!("stream client lagged and skipped {skipped} message(s)"),
                            None,
                        ));
                        let resync = {
                            let session = state.session.lock().await;
                            OutboundEvent::StateUpdate(session.city().snapshot(None))
                        };

                        if send_event(&mut socket, &warning).await.is_err()
                            || send_event(&mut socket, &resync).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    debug!(participant_id = ?participant_id, "socket closed");
}

/// Routes one inbound frame into the session. Returns a reply meant for this
/// socket alone; everything else flows back through the delivery channel.
async fn handle_inbound(
    state: &AppState,
    participant_id: &mut Option<String>,
    raw: &str,
) -> Option<OutboundEvent> {
    let inbound = match serde_json::from_str::<InboundEvent>(raw) {
        Ok(inbound) => inbound,
        Err(err) => {
            return Some(socket_error(
                ErrorCode::InvalidMessage,
                "could not parse inbound event",
                Some(err.to_string()),
            ));
        }
    };

    match inbound {
        InboundEvent::Register { student_id } => {
            let student_id = student_id.trim();
            if student_id.is_empty() {
                return Some(socket_error(
                    ErrorCode::InvalidMessage,
                    "student_id must not be empty",
                    None,
                ));
            }

            *participant_id = Some(student_id.to_string());
            state.session.lock().await.on_participant_join(student_id);
            None
        }
        InboundEvent::RequestState => {
            let mut session = state.session.lock().await;
            match participant_id.as_deref() {
                Some(id) => {
                    session.on_state_requested(id);
                    None
                }
                None => Some(OutboundEvent::StateUpdate(session.city().snapshot(None))),
            }
        }
        InboundEvent::Move(submission) => {
            let Some(id) = participant_id.as_deref() else {
                return Some(socket_error(
                    ErrorCode::NotRegistered,
                    "register before submitting moves",
                    None,
                ));
            };

            if submission.student_id != id {
                return Some(socket_error(
                    ErrorCode::InvalidMessage,
                    "student_id does not match the registered participant",
                    Some(format!(
                        "registered={id} submitted={}",
                        submission.student_id
                    )),
                ));
            }

            state.session.lock().await.on_move_submitted(&submission);
            None
        }
    }
}

fn socket_error(code: ErrorCode, message: &str, details: Option<String>) -> OutboundEvent {
    OutboundEvent::Error(ApiError::new(code, message, details))
}

async fn send_event(socket: &mut WebSocket, event: &OutboundEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}
