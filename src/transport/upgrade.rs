//! Header-upgrade binding.
//!
//! The whole handshake happens inside one HTTP upgrade exchange:
//!
//! | Header       | Carried on          | Frame  |
//! |--------------|---------------------|--------|
//! | `lhs-hello`  | upgrade request     | Hello  |
//! | `lhs-bind`   | upgrade request     | Bind   |
//! | `lhs-mirror` | `101` response      | Mirror |
//! | `lhs-seal`   | `101` response      | Seal   |
//! | `lhs-error`  | error response      | code   |
//!
//! Each frame header is URL-safe base64 (no padding) of the frame JSON. The
//! server computes Mirror and Seal before answering, so a `101` is only ever
//! sent with a Seal attached. A failure answers with an HTTP error status,
//! the `lhs-error` header and the JSON error frame as body.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::CONTENT_TYPE;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::{ws_config, DuplexTransport};
use crate::error::{ErrorCode, LhsError, Result};
use crate::protocol::{
    Advance, ErrorReporter, EstablishedSession, Frame, FrameCodec, FrameError, Handshake,
    Rejection, Step,
};

/// Request header carrying Hello
pub const HELLO_HEADER: &str = "lhs-hello";
/// Request header carrying Bind
pub const BIND_HEADER: &str = "lhs-bind";
/// Response header carrying Mirror
pub const MIRROR_HEADER: &str = "lhs-mirror";
/// Response header carrying Seal
pub const SEAL_HEADER: &str = "lhs-seal";
/// Error response header carrying the error code
pub const ERROR_HEADER: &str = "lhs-error";

/// HTTP status used to refuse an upgrade.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::VersionMismatch | ErrorCode::EncodingNegotiationFailed => {
            StatusCode::NOT_ACCEPTABLE
        },
        ErrorCode::InvalidBind => StatusCode::UNAUTHORIZED,
        ErrorCode::TrustFailed => StatusCode::FORBIDDEN,
        ErrorCode::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorCode::FrameTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        ErrorCode::MalformedFrame | ErrorCode::OutOfOrder => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Refusal response for a failed upgrade.
pub fn error_response(error: &LhsError) -> ErrorResponse {
    let code = error.code();
    let body = serde_json::to_string(&ErrorReporter::frame(error)).ok();

    let mut response = ErrorResponse::new(body);
    *response.status_mut() = status_for(code);
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(ERROR_HEADER),
        HeaderValue::from_static(code.as_str()),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn header_frame(
    headers: &HeaderMap,
    name: &'static str,
    codec: &FrameCodec,
) -> std::result::Result<Frame, FrameError> {
    let value = headers
        .get(name)
        .ok_or(FrameError::MissingField(name))?
        .to_str()
        .map_err(|e| FrameError::Header(e.to_string()))?;
    codec.decode_header(value)
}

fn header_value(codec: &FrameCodec, frame: &Frame) -> Result<HeaderValue> {
    let encoded = codec.encode_header(frame)?;
    HeaderValue::from_str(&encoded).map_err(|e| LhsError::Transport(e.to_string()))
}

fn expect_reply(advance: Advance) -> std::result::Result<Frame, Rejection> {
    match advance {
        Advance::Reply(frame) => Ok(frame),
        Advance::Rejected(rejection) => Err(rejection),
        Advance::Established(_) => Err(Rejection {
            error: LhsError::OutOfOrder {
                expected: None,
                got: Step::Seal,
            },
            notify_peer: true,
        }),
    }
}

/// Server half: run Hello and Bind from the request headers and attach
/// Mirror and Seal to the response.
fn server_exchange(
    machine: &mut Handshake,
    codec: &mut FrameCodec,
    request: &Request,
) -> std::result::Result<(HeaderValue, HeaderValue), Rejection> {
    let headers = request.headers();

    let hello = header_frame(headers, HELLO_HEADER, codec)
        .map_err(|e| machine.reject(e.into(), true))?;
    let mirror = expect_reply(machine.advance(hello))?;
    codec.set_limit(machine.frame_limit());

    let bind = header_frame(headers, BIND_HEADER, codec)
        .map_err(|e| machine.reject(e.into(), true))?;
    let seal = expect_reply(machine.advance(bind))?;

    let mirror = header_value(codec, &mirror).map_err(|e| machine.reject(e, true))?;
    let seal = header_value(codec, &seal).map_err(|e| machine.reject(e, true))?;
    Ok((mirror, seal))
}

/// Accept one upgrade connection and complete the handshake.
///
/// The whole exchange is bounded by the machine's Hello deadline.
pub async fn accept<S>(
    stream: S,
    machine: &mut Handshake,
    codec: &mut FrameCodec,
) -> Result<(EstablishedSession, WebSocketStream<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = machine.deadline().map(Instant::from_std);
    let config = ws_config(machine.frame_limit());
    let mut refused: Option<Rejection> = None;

    let result = {
        let refused = &mut refused;
        let machine = &mut *machine;
        let codec = &mut *codec;
        let callback = move |request: &Request, mut response: Response| {
            match server_exchange(machine, codec, request) {
                Ok((mirror, seal)) => {
                    let headers = response.headers_mut();
                    headers.insert(HeaderName::from_static(MIRROR_HEADER), mirror);
                    headers.insert(HeaderName::from_static(SEAL_HEADER), seal);
                    Ok(response)
                },
                Err(rejection) => {
                    let response = error_response(&rejection.error);
                    *refused = Some(rejection);
                    Err(response)
                },
            }
        };

        let accept =
            tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config));
        match deadline {
            Some(deadline) => timeout_at(deadline, accept).await.ok(),
            None => Some(accept.await),
        }
    };

    if let Some(rejection) = refused {
        debug!(code = %rejection.error.code(), "upgrade refused");
        return Err(rejection.error);
    }

    match result {
        Some(Ok(ws)) => {
            let session = machine.enter_flow()?;
            Ok((session, ws))
        },
        Some(Err(e)) => {
            debug!(error = %e, "upgrade failed");
            machine.abort();
            Err(e.into())
        },
        None => Err(machine.expire().error),
    }
}

fn peer_refusal(response: &tokio_tungstenite::tungstenite::handshake::client::Response) -> LhsError {
    let code = response
        .headers()
        .get(ERROR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<ErrorCode>().ok());

    let Some(code) = code else {
        return LhsError::PeerRejected {
            code: ErrorCode::Internal,
            detail: format!("upgrade refused with HTTP {}", response.status()),
        };
    };

    let detail = response
        .body()
        .as_deref()
        .and_then(|body| serde_json::from_slice::<Frame>(body).ok())
        .and_then(|frame| match frame {
            Frame::Error(e) => Some(e.detail),
            _ => None,
        })
        .unwrap_or_default();

    LhsError::PeerRejected { code, detail }
}

/// Client half: verify the Mirror and Seal attached to a `101`.
fn client_exchange(
    machine: &mut Handshake,
    codec: &mut FrameCodec,
    headers: &HeaderMap,
) -> std::result::Result<EstablishedSession, Rejection> {
    let mirror = header_frame(headers, MIRROR_HEADER, codec)
        .map_err(|e| machine.reject(e.into(), true))?;
    // The Bind reply already travelled with the request
    expect_reply(machine.advance(mirror))?;
    codec.set_limit(machine.frame_limit());

    let seal = header_frame(headers, SEAL_HEADER, codec)
        .map_err(|e| machine.reject(e.into(), true))?;
    match machine.advance(seal) {
        Advance::Established(session) => Ok(session),
        Advance::Rejected(rejection) => Err(rejection),
        Advance::Reply(frame) => Err(machine.reject(
            LhsError::OutOfOrder {
                expected: None,
                got: frame.step(),
            },
            true,
        )),
    }
}

/// Send Hello and Bind as upgrade request headers over `stream` and
/// complete the handshake from the `101` response.
///
/// A refused upgrade surfaces as [`LhsError::PeerRejected`] when the server
/// named an error code.
pub async fn connect<S>(
    stream: S,
    url: &str,
    machine: &mut Handshake,
    codec: &mut FrameCodec,
) -> Result<(EstablishedSession, WebSocketStream<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let bind = machine
        .bind_frame()
        .ok_or_else(|| LhsError::Config("upgrade connect needs a client machine".into()))?;
    let mut request = url.into_client_request()?;
    let hello = machine.start()?;
    let headers = request.headers_mut();
    headers.insert(
        HeaderName::from_static(HELLO_HEADER),
        header_value(codec, &hello)?,
    );
    headers.insert(HeaderName::from_static(BIND_HEADER), header_value(codec, &bind)?);

    let config = ws_config(machine.frame_limit());
    let connect = tokio_tungstenite::client_async_with_config(request, stream, Some(config));
    let outcome = match machine.deadline() {
        Some(deadline) => timeout_at(Instant::from_std(deadline), connect).await.ok(),
        None => Some(connect.await),
    };

    let (ws, response) = match outcome {
        Some(Ok(pair)) => pair,
        Some(Err(WsError::Http(response))) => {
            return Err(machine.reject(peer_refusal(&response), false).error);
        },
        Some(Err(e)) => {
            machine.abort();
            return Err(e.into());
        },
        None => return Err(machine.expire().error),
    };

    match client_exchange(machine, codec, response.headers()) {
        Ok(session) => Ok((session, ws)),
        Err(rejection) => {
            let mut transport = DuplexTransport::new(ws);
            ErrorReporter::new(machine.role())
                .report(&mut transport, codec, &rejection)
                .await;
            Err(rejection.error)
        },
    }
}
