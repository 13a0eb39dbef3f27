fn apply_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("GET,OPTIONS"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static("3600"),
    );
}

fn paginate(
    total: usize,
    cursor: Option<usize>,
    page_size: Option<usize>,
) -> Result<(usize, usize, Option<usize>), HttpApiError> {
    let start = cursor.unwrap_or(0);
    if start > total {
        return Err(HttpApiError::invalid_query(
            "cursor is out of bounds",
            Some(format!("cursor={start} total={total}")),
        ));
    }

    let size = page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let end = start.saturating_add(size).min(total);
    let next_cursor = (end < total).then_some(end);

    Ok((start, end, next_cursor))
}

/// Broadcasts reach every socket, registered or not; targeted deliveries only
/// reach the socket registered under that id.
fn is_deliverable(delivery: &Delivery, participant_id: Option<&str>) -> bool {
    match (delivery.target.as_deref(), participant_id) {
        (None, _) => true,
        (Some(_), Some(id)) => delivery.is_visible_to(id),
        (Some(_), None) => false,
    }
}
