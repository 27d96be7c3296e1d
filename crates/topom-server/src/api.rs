//! Admin HTTP API.
//!
//! Read-only views live at the top level. Everything under `/api/topom`
//! except the model carries the controller's xauth as its first path
//! parameter. Successful mutations answer `"OK"`; failures answer
//! `{"error":{"kind":..,"msg":..}}` with a status derived from the
//! error kind.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use topom_core::{ErrorKind, Topom, TopomError};
use tracing::{debug, info, warn};

pub struct ApiState {
    pub topom: Arc<Topom>,
    pub metrics: Option<PrometheusHandle>,
}

/// Why an admin request was refused.
#[derive(Debug)]
enum ApiError {
    XAuth,
    BadParam(String),
    NoRoute(String),
    Topom(TopomError),
}

impl From<TopomError> for ApiError {
    fn from(e: TopomError) -> Self {
        ApiError::Topom(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::XAuth => StatusCode::FORBIDDEN,
            ApiError::BadParam(_) => StatusCode::BAD_REQUEST,
            ApiError::NoRoute(_) => StatusCode::NOT_FOUND,
            ApiError::Topom(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Topom(e) => match e.kind() {
                ErrorKind::Precondition => StatusCode::BAD_REQUEST,
                ErrorKind::Store => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Broadcast | ErrorKind::Backend | ErrorKind::Sentinel => {
                    StatusCode::BAD_GATEWAY
                }
                ErrorKind::Fatal | ErrorKind::Closed => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::XAuth => "xauth",
            ApiError::BadParam(_) | ApiError::NoRoute(_) => "precondition",
            ApiError::Topom(e) => e.kind().as_str(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::XAuth => "invalid xauth, please check product name & auth".into(),
            ApiError::BadParam(msg) | ApiError::NoRoute(msg) => msg.clone(),
            ApiError::Topom(e) => e.to_string(),
        }
    }
}

type ApiResult = Result<Response<Full<Bytes>>, ApiError>;

/// Accepts admin connections until the controller closes.
pub async fn serve(listener: TcpListener, state: Arc<ApiState>) {
    if let Ok(addr) = listener.local_addr() {
        info!("admin api listening on http://{addr}");
    }
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("admin listener accept error: {e}");
                    continue;
                }
            },
            _ = state.topom.closed() => break,
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(handle(&state, req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, "http connection error: {e}");
            }
        });
    }
    info!("admin api stopped");
}

async fn handle(state: &ApiState, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    route(state, req.method(), req.uri().path()).await
}

/// Dispatches one request by method and path.
pub(crate) async fn route(state: &ApiState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let result = match (method, segs.as_slice()) {
        (&Method::GET, ["api", "topom", rest @ ..]) => api_get(state, rest).await,
        (&Method::PUT, ["api", "topom", rest @ ..]) => api_put(&state.topom, rest).await,
        (&Method::GET, rest) => view(state, rest).await,
        _ => Err(no_route(method, path)),
    };
    match result {
        Ok(resp) => resp,
        Err(ApiError::NoRoute(_)) => error_response(&no_route(method, path)),
        Err(e) => {
            if !matches!(e, ApiError::XAuth) {
                warn!(%method, path, "admin request failed: {}", e.message());
            }
            error_response(&e)
        }
    }
}

async fn view(state: &ApiState, segs: &[&str]) -> ApiResult {
    let t = &state.topom;
    match segs {
        [] | ["topom"] => Ok(json(&t.overview().await?)),
        ["topom", "model"] => Ok(json(t.model())),
        ["topom", "stats"] => Ok(json(&t.stats().await?)),
        ["topom", "slots"] => Ok(json(&t.slots().await?)),
        ["metrics"] => match &state.metrics {
            Some(handle) => Ok(text(handle.render())),
            None => Err(ApiError::NoRoute("metrics are disabled".into())),
        },
        _ => Err(ApiError::NoRoute(String::new())),
    }
}

async fn api_get(state: &ApiState, segs: &[&str]) -> ApiResult {
    let t = &state.topom;
    match segs {
        ["model"] => Ok(json(t.model())),
        ["xping", xauth] => {
            check_xauth(t, xauth)?;
            Ok(ok())
        }
        ["stats", xauth] => {
            check_xauth(t, xauth)?;
            Ok(json(&t.stats().await?))
        }
        ["slots", xauth] => {
            check_xauth(t, xauth)?;
            Ok(json(&t.slots().await?))
        }
        _ => Err(ApiError::NoRoute(String::new())),
    }
}

async fn api_put(t: &Arc<Topom>, segs: &[&str]) -> ApiResult {
    match segs {
        ["reload", xauth] => {
            check_xauth(t, xauth)?;
            t.reload().await?;
        }
        ["shutdown", xauth] => {
            check_xauth(t, xauth)?;
            t.close().await?;
        }

        ["proxy", "create" | "online", xauth, addr] => {
            check_xauth(t, xauth)?;
            t.create_proxy(addr).await?;
        }
        ["proxy", "reinit", xauth, token] => {
            check_xauth(t, xauth)?;
            t.reinit_proxy(token).await?;
        }
        ["proxy", "remove", xauth, token, force] => {
            check_xauth(t, xauth)?;
            t.remove_proxy(token, parse_bool(force)?).await?;
        }

        ["group", "create", xauth, gid] => {
            check_xauth(t, xauth)?;
            t.create_group(parse_num(gid)?).await?;
        }
        ["group", "remove", xauth, gid] => {
            check_xauth(t, xauth)?;
            t.remove_group(parse_num(gid)?).await?;
        }
        ["group", "add", xauth, gid, addr] => {
            check_xauth(t, xauth)?;
            t.group_add_server(parse_num(gid)?, addr).await?;
        }
        ["group", "del", xauth, gid, addr] => {
            check_xauth(t, xauth)?;
            t.group_del_server(parse_num(gid)?, addr).await?;
        }
        ["group", "promote", xauth, gid, addr] => {
            check_xauth(t, xauth)?;
            t.group_promote_server(parse_num(gid)?, addr).await?;
        }
        ["group", "promote-commit", xauth, gid] => {
            check_xauth(t, xauth)?;
            t.group_promote_commit(parse_num(gid)?).await?;
        }
        ["group", "resync", xauth, gid] => {
            check_xauth(t, xauth)?;
            t.resync_group(parse_num(gid)?).await?;
        }
        ["group", "action", "create", xauth, addr] => {
            check_xauth(t, xauth)?;
            t.sync_create_action(addr).await?;
        }
        ["group", "action", "remove", xauth, addr] => {
            check_xauth(t, xauth)?;
            t.sync_remove_action(addr).await?;
        }

        ["sentinels", "add", xauth, addr] => {
            check_xauth(t, xauth)?;
            t.add_sentinel(addr).await?;
        }
        ["sentinels", "del", xauth, addr, force] => {
            check_xauth(t, xauth)?;
            t.del_sentinel(addr, parse_bool(force)?).await?;
        }
        ["sentinels", "resync-all", xauth] => {
            check_xauth(t, xauth)?;
            t.resync_sentinels().await?;
        }

        ["slots", "action", "create", xauth, sid, gid] => {
            check_xauth(t, xauth)?;
            t.slot_create_action(parse_num(sid)?, parse_num(gid)?).await?;
        }
        ["slots", "action", "create-range", xauth, beg, end, gid] => {
            check_xauth(t, xauth)?;
            t.slot_create_action_range(parse_num(beg)?, parse_num(end)?, parse_num(gid)?)
                .await?;
        }
        ["slots", "action", "remove", xauth, sid] => {
            check_xauth(t, xauth)?;
            t.slot_remove_action(parse_num(sid)?).await?;
        }
        ["slots", "action", "interval", xauth, value] => {
            check_xauth(t, xauth)?;
            t.set_slot_action_interval(parse_num(value)?);
        }
        ["slots", "action", "disabled", xauth, value] => {
            check_xauth(t, xauth)?;
            t.set_slot_action_disabled(parse_bool(value)?);
        }

        _ => return Err(ApiError::NoRoute(String::new())),
    }
    Ok(ok())
}

fn check_xauth(t: &Topom, given: &str) -> Result<(), ApiError> {
    if topom_core::verify(t.xauth(), given) {
        Ok(())
    } else {
        Err(ApiError::XAuth)
    }
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadParam(format!("invalid number '{s}'")))
}

fn parse_bool(s: &str) -> Result<bool, ApiError> {
    match s {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ApiError::BadParam(format!("invalid boolean '{s}'"))),
    }
}

fn no_route(method: &Method, path: &str) -> ApiError {
    ApiError::NoRoute(format!("no route for {method} {path}"))
}

fn respond(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json<T: Serialize + ?Sized>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(value) {
        Ok(body) => respond(StatusCode::OK, "application/json; charset=utf-8", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain; charset=utf-8",
            format!("encode response: {e}").into_bytes(),
        ),
    }
}

fn text(body: String) -> Response<Full<Bytes>> {
    respond(
        StatusCode::OK,
        "text/plain; version=0.0.4; charset=utf-8",
        body.into_bytes(),
    )
}

fn ok() -> Response<Full<Bytes>> {
    json("OK")
}

fn error_response(e: &ApiError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": {
            "kind": e.kind(),
            "msg": e.message(),
        }
    });
    let mut resp = json(&body);
    *resp.status_mut() = e.status();
    resp
}
