use alloy_primitives::Address;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ck_api_types::{
    ChainId, DappMetadata, PairingApproveRequest, PairingCreateRequest, PairingCreateResponse, PairingKeyQuery,
    PairingRejectRequest, PairingStatus, PairingStatusResponse, PendingRequestsResponse, RelayRequestCreated,
    RelayRequestStatus, RelayResponseRequest, RelayRpcRequest,
};
use ck_connectors::{PairingUri, build_pairing_uri};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{ApiError, AppState, ApiResult, bad_request, conflict, not_found, unauthorized};

const KEY_LEN: usize = 32;

/// One proposed pairing and, once approved, the queue of requests the app
/// sends to the wallet.
pub(crate) struct PairingEntry {
    key: String,
    dapp: DappMetadata,
    status: PairingStatus,
    chain_id: ChainId,
    accounts: Vec<String>,
    reason: Option<String>,
    expires_at: Instant,
    requests: Vec<RelayRequestStatus>,
    next_id: u64,
}

impl PairingEntry {
    fn check_key(&self, key: &str) -> Result<(), ApiError> {
        if self.key != key {
            return Err(unauthorized("invalid pairing key"));
        }
        Ok(())
    }

    /// An unanswered proposal expires; an approved session lives until
    /// either side closes it.
    fn refresh(&mut self, now: Instant) {
        if self.status == PairingStatus::Pending && now > self.expires_at {
            self.status = PairingStatus::Expired;
        }
    }

    fn response(&self, topic: &str) -> PairingStatusResponse {
        PairingStatusResponse {
            topic: topic.to_owned(),
            status: self.status,
            dapp: Some(self.dapp.clone()),
            accounts: self.accounts.clone(),
            chain_id: Some(self.chain_id),
            reason: self.reason.clone(),
        }
    }

    fn require_pending(&mut self) -> Result<(), ApiError> {
        self.refresh(Instant::now());
        if self.status != PairingStatus::Pending {
            return Err(conflict(&format!("pairing is {}", status_label(self.status))));
        }
        Ok(())
    }
}

fn status_label(status: PairingStatus) -> &'static str {
    match status {
        PairingStatus::Pending => "pending",
        PairingStatus::Approved => "approved",
        PairingStatus::Rejected => "rejected",
        PairingStatus::Expired => "expired",
        PairingStatus::Cancelled => "cancelled",
    }
}

fn unknown_pairing() -> ApiError {
    not_found("unknown pairing")
}

pub(crate) async fn pairing_create(
    State(state): State<AppState>,
    Json(request): Json<PairingCreateRequest>,
) -> ApiResult<PairingCreateResponse> {
    let topic = Uuid::new_v4().simple().to_string();
    let mut key_bytes = [0_u8; KEY_LEN];
    OsRng.fill_bytes(&mut key_bytes);
    let key = URL_SAFE_NO_PAD.encode(key_bytes);

    let uri = build_pairing_uri(&PairingUri {
        topic: topic.clone(),
        relay: state.config.public_url.clone(),
        key: key.clone(),
    });

    let ttl = state.config.pairing_ttl;
    let now = Instant::now();
    {
        let mut pairings = state.pairings.write().await;
        // Finished proposals stay readable for one more ttl so pollers see the outcome.
        pairings.retain(|_, entry| entry.status == PairingStatus::Approved || now <= entry.expires_at + ttl);
        pairings.insert(
            topic.clone(),
            PairingEntry {
                key: key.clone(),
                dapp: request.dapp,
                status: PairingStatus::Pending,
                chain_id: request.chain_id,
                accounts: Vec::new(),
                reason: None,
                expires_at: now + ttl,
                requests: Vec::new(),
                next_id: 1,
            },
        );
    }

    debug!(%topic, chain_id = %request.chain_id, "pairing proposed");
    Ok(Json(PairingCreateResponse {
        topic,
        key,
        uri,
        expires_in: ttl.as_secs(),
    }))
}

pub(crate) async fn pairing_status(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(query): Query<PairingKeyQuery>,
) -> ApiResult<PairingStatusResponse> {
    let mut pairings = state.pairings.write().await;
    let entry = pairings.get_mut(&topic).ok_or_else(unknown_pairing)?;
    entry.check_key(&query.key)?;
    entry.refresh(Instant::now());
    Ok(Json(entry.response(&topic)))
}

pub(crate) async fn pairing_approve(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(request): Json<PairingApproveRequest>,
) -> ApiResult<PairingStatusResponse> {
    if request.accounts.is_empty() {
        return Err(bad_request("at least one account is required"));
    }
    for account in &request.accounts {
        account
            .parse::<Address>()
            .map_err(|err| bad_request(&format!("invalid account {account}: {err}")))?;
    }

    let mut pairings = state.pairings.write().await;
    let entry = pairings.get_mut(&topic).ok_or_else(unknown_pairing)?;
    entry.check_key(&request.key)?;
    entry.require_pending()?;

    entry.status = PairingStatus::Approved;
    entry.accounts = request.accounts;
    entry.chain_id = request.chain_id;
    info!(%topic, chain_id = %request.chain_id, "pairing approved by wallet");
    Ok(Json(entry.response(&topic)))
}

pub(crate) async fn pairing_reject(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(request): Json<PairingRejectRequest>,
) -> ApiResult<PairingStatusResponse> {
    let mut pairings = state.pairings.write().await;
    let entry = pairings.get_mut(&topic).ok_or_else(unknown_pairing)?;
    entry.check_key(&request.key)?;
    entry.require_pending()?;

    entry.status = PairingStatus::Rejected;
    entry.reason = request.reason;
    info!(%topic, "pairing rejected by wallet");
    Ok(Json(entry.response(&topic)))
}

pub(crate) async fn pairing_cancel(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(query): Query<PairingKeyQuery>,
) -> ApiResult<PairingStatusResponse> {
    let mut pairings = state.pairings.write().await;
    pairings.get(&topic).ok_or_else(unknown_pairing)?.check_key(&query.key)?;
    let mut entry = pairings.remove(&topic).ok_or_else(unknown_pairing)?;

    entry.status = PairingStatus::Cancelled;
    info!(%topic, "pairing closed");
    Ok(Json(entry.response(&topic)))
}

pub(crate) async fn relay_request_create(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(request): Json<RelayRpcRequest>,
) -> ApiResult<RelayRequestCreated> {
    if request.method.trim().is_empty() {
        return Err(bad_request("method is required"));
    }

    let mut pairings = state.pairings.write().await;
    let entry = pairings.get_mut(&topic).ok_or_else(unknown_pairing)?;
    entry.check_key(&request.key)?;
    if entry.status != PairingStatus::Approved {
        return Err(conflict(&format!("pairing is {}", status_label(entry.status))));
    }

    let id = entry.next_id;
    entry.next_id += 1;
    entry.requests.push(RelayRequestStatus {
        id,
        method: request.method,
        params: request.params,
        result: None,
        error: None,
    });
    debug!(%topic, id, "request queued for wallet");
    Ok(Json(RelayRequestCreated { id }))
}

/// Settled requests are dropped once the app has read them.
pub(crate) async fn relay_request_status(
    State(state): State<AppState>,
    Path((topic, id)): Path<(String, u64)>,
    Query(query): Query<PairingKeyQuery>,
) -> ApiResult<RelayRequestStatus> {
    let mut pairings = state.pairings.write().await;
    let entry = pairings.get_mut(&topic).ok_or_else(unknown_pairing)?;
    entry.check_key(&query.key)?;

    let index = entry
        .requests
        .iter()
        .position(|request| request.id == id)
        .ok_or_else(|| not_found("unknown request"))?;
    if entry.requests[index].is_settled() {
        return Ok(Json(entry.requests.remove(index)));
    }
    Ok(Json(entry.requests[index].clone()))
}

pub(crate) async fn relay_pending(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(query): Query<PairingKeyQuery>,
) -> ApiResult<PendingRequestsResponse> {
    let pairings = state.pairings.read().await;
    let entry = pairings.get(&topic).ok_or_else(unknown_pairing)?;
    entry.check_key(&query.key)?;

    Ok(Json(PendingRequestsResponse {
        requests: entry
            .requests
            .iter()
            .filter(|request| !request.is_settled())
            .cloned()
            .collect(),
    }))
}

pub(crate) async fn relay_request_respond(
    State(state): State<AppState>,
    Path((topic, id)): Path<(String, u64)>,
    Json(response): Json<RelayResponseRequest>,
) -> ApiResult<RelayRequestStatus> {
    if response.result.is_some() == response.error.is_some() {
        return Err(bad_request("exactly one of result and error is required"));
    }

    let mut pairings = state.pairings.write().await;
    let entry = pairings.get_mut(&topic).ok_or_else(unknown_pairing)?;
    entry.check_key(&response.key)?;

    let request = entry
        .requests
        .iter_mut()
        .find(|request| request.id == id)
        .ok_or_else(|| not_found("unknown request"))?;
    if request.is_settled() {
        return Err(conflict("request already answered"));
    }
    request.result = response.result;
    request.error = response.error;
    debug!(%topic, id, failed = request.error.is_some(), "wallet answered request");
    Ok(Json(request.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use crate::testing::{call, parse, state};
    use axum::http::{Method, StatusCode};
    use ck_connectors::parse_pairing_uri;
    use serde_json::json;

    const ACCOUNT: &str = "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf";

    async fn propose(app: &axum::Router) -> anyhow::Result<PairingCreateResponse> {
        let (status, body) = call(
            app,
            Method::POST,
            "/pairing",
            None,
            Some(json!({ "dapp": { "name": "Dapp", "url": "https://dapp.test" }, "chain_id": 137 })),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        parse(body)
    }

    async fn status(app: &axum::Router, created: &PairingCreateResponse) -> anyhow::Result<(StatusCode, serde_json::Value)> {
        call(
            app,
            Method::GET,
            &format!("/pairing/{}?key={}", created.topic, created.key),
            None,
            None,
        )
        .await
    }

    async fn approve(app: &axum::Router, created: &PairingCreateResponse) -> anyhow::Result<(StatusCode, serde_json::Value)> {
        call(
            app,
            Method::POST,
            &format!("/pairing/{}/approve", created.topic),
            None,
            Some(json!({ "key": created.key, "accounts": [ACCOUNT], "chain_id": 1 })),
        )
        .await
    }

    #[tokio::test]
    async fn proposal_uri_points_at_public_url() -> anyhow::Result<()> {
        let (state, _) = state();
        let app = router(state);
        let created = propose(&app).await?;

        let uri = parse_pairing_uri(&created.uri)?;
        assert_eq!(uri.topic, created.topic);
        assert_eq!(uri.key, created.key);
        assert_eq!(uri.relay, "http://relay.test");
        assert_eq!(created.expires_in, 300);

        let (code, body) = status(&app, &created).await?;
        assert_eq!(code, StatusCode::OK);
        let pending: PairingStatusResponse = parse(body)?;
        assert_eq!(pending.status, PairingStatus::Pending);
        assert_eq!(pending.chain_id, Some(ChainId::POLYGON));
        assert_eq!(pending.dapp.map(|dapp| dapp.name), Some("Dapp".to_owned()));
        Ok(())
    }

    #[tokio::test]
    async fn approval_is_visible_once_and_wrong_key_is_refused() -> anyhow::Result<()> {
        let (state, _) = state();
        let app = router(state);
        let created = propose(&app).await?;

        let (code, _) = call(
            &app,
            Method::GET,
            &format!("/pairing/{}?key=wrong", created.topic),
            None,
            None,
        )
        .await?;
        assert_eq!(code, StatusCode::UNAUTHORIZED);

        let (code, _) = approve(&app, &created).await?;
        assert_eq!(code, StatusCode::OK);
        let (_, body) = status(&app, &created).await?;
        let approved: PairingStatusResponse = parse(body)?;
        assert_eq!(approved.status, PairingStatus::Approved);
        assert_eq!(approved.accounts, vec![ACCOUNT.to_owned()]);
        assert_eq!(approved.chain_id, Some(ChainId::MAINNET));

        let (code, body) = approve(&app, &created).await?;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["error"], "pairing is approved");
        Ok(())
    }

    #[tokio::test]
    async fn rejection_carries_reason() -> anyhow::Result<()> {
        let (state, _) = state();
        let app = router(state);
        let created = propose(&app).await?;

        let (code, _) = call(
            &app,
            Method::POST,
            &format!("/pairing/{}/reject", created.topic),
            None,
            Some(json!({ "key": created.key, "reason": "not now" })),
        )
        .await?;
        assert_eq!(code, StatusCode::OK);

        let (_, body) = status(&app, &created).await?;
        let rejected: PairingStatusResponse = parse(body)?;
        assert_eq!(rejected.status, PairingStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("not now"));
        let (code, _) = approve(&app, &created).await?;
        assert_eq!(code, StatusCode::CONFLICT);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_proposal_expires() -> anyhow::Result<()> {
        let (state, _) = state();
        let ttl = state.config.pairing_ttl;
        let app = router(state);
        let created = propose(&app).await?;

        tokio::time::advance(ttl + std::time::Duration::from_secs(1)).await;
        let (_, body) = status(&app, &created).await?;
        assert_eq!(body["status"], "expired");
        let (code, _) = approve(&app, &created).await?;
        assert_eq!(code, StatusCode::CONFLICT);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_pairing_disappears() -> anyhow::Result<()> {
        let (state, _) = state();
        let app = router(state);
        let created = propose(&app).await?;
        let path = format!("/pairing/{}?key={}", created.topic, created.key);

        let (code, body) = call(&app, Method::DELETE, &path, None, None).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
        let (code, _) = status(&app, &created).await?;
        assert_eq!(code, StatusCode::NOT_FOUND);
        let (code, _) = call(&app, Method::DELETE, &path, None, None).await?;
        assert_eq!(code, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn requests_flow_from_app_to_wallet_and_back() -> anyhow::Result<()> {
        let (state, _) = state();
        let app = router(state);
        let created = propose(&app).await?;
        let requests = format!("/pairing/{}/requests", created.topic);
        let rpc = json!({ "key": created.key, "method": "personal_sign", "params": ["0x676d", ACCOUNT] });

        let (code, _) = call(&app, Method::POST, &requests, None, Some(rpc.clone())).await?;
        assert_eq!(code, StatusCode::CONFLICT, "no requests before approval");

        approve(&app, &created).await?;
        let (code, body) = call(&app, Method::POST, &requests, None, Some(rpc)).await?;
        assert_eq!(code, StatusCode::OK);
        let queued: RelayRequestCreated = parse(body)?;

        let (_, body) = call(
            &app,
            Method::GET,
            &format!("/pairing/{}/pending?key={}", created.topic, created.key),
            None,
            None,
        )
        .await?;
        let pending: PendingRequestsResponse = parse(body)?;
        assert_eq!(pending.requests.len(), 1);
        assert_eq!(pending.requests[0].method, "personal_sign");

        let status_path = format!("{requests}/{}?key={}", queued.id, created.key);
        let (_, body) = call(&app, Method::GET, &status_path, None, None).await?;
        assert!(!parse::<RelayRequestStatus>(body)?.is_settled());

        let respond = format!("{requests}/{}/response", queued.id);
        let (code, _) = call(
            &app,
            Method::POST,
            &respond,
            None,
            Some(json!({ "key": created.key, "result": "0xsig" })),
        )
        .await?;
        assert_eq!(code, StatusCode::OK);
        let (code, _) = call(
            &app,
            Method::POST,
            &respond,
            None,
            Some(json!({ "key": created.key, "result": "0xother" })),
        )
        .await?;
        assert_eq!(code, StatusCode::CONFLICT);

        let (_, body) = call(&app, Method::GET, &status_path, None, None).await?;
        let settled: RelayRequestStatus = parse(body)?;
        assert_eq!(settled.result, Some(json!("0xsig")));
        let (code, _) = call(&app, Method::GET, &status_path, None, None).await?;
        assert_eq!(code, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn response_needs_exactly_one_outcome() -> anyhow::Result<()> {
        let (state, _) = state();
        let app = router(state);
        let (code, _) = call(
            &app,
            Method::POST,
            "/pairing/any/requests/1/response",
            None,
            Some(json!({ "key": "k" })),
        )
        .await?;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        Ok(())
    }
}
