#[derive(Debug, Default, Deserialize)]
struct StateQuery {
    from_idx: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct MovesQuery {
    cursor: Option<usize>,
    page_size: Option<usize>,
}

async fn get_session(State(state): State<AppState>) -> Json<SessionStatus> {
    let session = state.session.lock().await;
    Json(session.session_status())
}

async fn get_state(
    State(state): State<AppState>,
    Query(query): Query<StateQuery>,
) -> Result<Json<CitySnapshot>, HttpApiError> {
    let session = state.session.lock().await;
    let total_blocks = session.city().total_blocks();
    if let Some(from_idx) = query.from_idx {
        if from_idx >= total_blocks {
            return Err(HttpApiError::invalid_query(
                "from_idx is out of range",
                Some(format!("from_idx={from_idx} total_blocks={total_blocks}")),
            ));
        }
    }

    Ok(Json(session.city().snapshot(query.from_idx)))
}

async fn get_moves(
    State(state): State<AppState>,
    Query(query): Query<MovesQuery>,
) -> Result<Json<QueryResponse>, HttpApiError> {
    let session = state.session.lock().await;
    let store = session.move_log();

    let total = store.count_moves().map_err(HttpApiError::from_persistence)?;
    let (start, end, next_cursor) = paginate(total, query.cursor, query.page_size)?;
    let moves = store
        .load_moves(start, end - start)
        .map_err(HttpApiError::from_persistence)?;

    Ok(Json(QueryResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        query_type: "moves".to_string(),
        session_id: session.session_id().to_string(),
        generated_at_move: session.moves_applied(),
        data: json!({
            "moves": moves,
            "total": total,
            "next_cursor": next_cursor,
        }),
    }))
}
